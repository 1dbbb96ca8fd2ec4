//! Item extraction: resolving `iloc` extents to raw bytes, and assembling
//! HEVC elementary streams (parameter-set prepending, Annex-B rewriting).
//!
//! See ISO/IEC 14496-12 § 8.11.3, ISO/IEC 14496-15 § 8.3.3 (the `hvcC` to
//! Annex-B conversion), and ISO/IEC 23008-12 § 6.6 for grid/overlay items.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::meta::{ConstructionMethod, ExtentRange, HeifMeta, ImageProperty};
use crate::{Error, MediaDataBox, Result, ToU64, ToUsize, TryVec};

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Resolve every `iloc` extent of `item_id` to its raw bytes, in extent
/// order, reading from the buffered `mdat`/`idat` data gathered during the
/// initial sequential parse.
pub(crate) fn item_raw_bytes(
    item_id: u32,
    meta: &HeifMeta,
    mdats: &mut TryVec<MediaDataBox>,
) -> Result<TryVec<u8>> {
    let loc = meta
        .iloc_items
        .iter()
        .find(|l| l.item_id == item_id)
        .ok_or(Error::InvalidData("item has no iloc entry"))?;

    let mut data = TryVec::new();

    match loc.construction_method {
        ConstructionMethod::Idat => {
            for extent in loc.extents.iter() {
                let slice = slice_for_extent(&meta.idat, &extent.extent_range)?;
                data.extend_from_slice(slice)?;
                check_cumulative_size(data.len())?;
            }
        }
        ConstructionMethod::File => {
            for extent in loc.extents.iter() {
                let mut found = false;
                for mdat in mdats.iter_mut() {
                    if mdat.matches_extent(&extent.extent_range) {
                        data.extend_from_slice(&mdat.data)?;
                        found = true;
                        break;
                    } else if mdat.contains_extent(&extent.extent_range) {
                        mdat.read_extent(&extent.extent_range, &mut data)?;
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(Error::InvalidData(
                        "iloc contains an extent that is not in any mdat",
                    ));
                }
                check_cumulative_size(data.len())?;
            }
        }
    }

    Ok(data)
}

/// One item's extents can each individually sit under the memory block
/// limit while together, concatenated across up to `MAX_EXTENTS_PER_ITEM`
/// separate `mdat`/`idat` sources, exceeding it; check after every extent
/// is appended rather than relying on any single box's own size check.
fn check_cumulative_size(len: usize) -> Result<()> {
    if len.to_u64() > crate::MAX_MEMORY_BLOCK_SIZE {
        return Err(Error::Unsupported(
            "item extraction exceeds memory block limit",
        ));
    }
    Ok(())
}

fn slice_for_extent<'a>(buf: &'a [u8], extent: &ExtentRange) -> Result<&'a [u8]> {
    let slice = match extent {
        ExtentRange::WithLength(range) => {
            let start: usize = range.start.try_into()?;
            let end: usize = range.end.try_into()?;
            buf.get(start..end)
        }
        ExtentRange::ToEnd(range) => {
            let start: usize = range.start.try_into()?;
            buf.get(start..)
        }
    };
    slice.ok_or(Error::InvalidData("idat extent out of range"))
}

/// Rewrite a sequence of `hvcC`-style length-prefixed NAL units (as found
/// directly in `mdat`) into an Annex-B elementary stream: every NAL unit,
/// however many are packed back-to-back in one extent, gets its own
/// `00 00 00 01` start code.
fn rewrite_length_prefixed_to_annex_b(
    data: &[u8],
    length_size: usize,
    out: &mut TryVec<u8>,
) -> Result<()> {
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + length_size > data.len() {
            return Err(Error::InvalidData("truncated NAL length field"));
        }
        let nal_len = match length_size {
            1 => usize::from(data[pos]),
            2 => usize::from(u16::from_be_bytes([data[pos], data[pos + 1]])),
            4 => u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                .to_usize(),
            _ => return Err(Error::Unsupported("unsupported hvcC length_size")),
        };
        pos += length_size;
        if pos + nal_len > data.len() {
            return Err(Error::InvalidData("NAL unit overruns extent"));
        }
        out.extend_from_slice(&ANNEX_B_START_CODE)?;
        out.extend_from_slice(&data[pos..pos + nal_len])?;
        pos += nal_len;
    }
    Ok(())
}

/// Produce the decodable Annex-B elementary stream for an `hvc1` item:
/// the `hvcC` parameter sets (VPS/SPS/PPS, in record order) prepended to
/// the item's own sample data, all in Annex-B form.
pub(crate) fn hevc_annex_b_bytes(
    item_id: u32,
    meta: &HeifMeta,
    mdats: &mut TryVec<MediaDataBox>,
) -> Result<TryVec<u8>> {
    let hvcc = meta.properties.iter().find_map(|(id, prop)| {
        if *id == item_id {
            if let ImageProperty::HevcConfig(cfg) = prop {
                return Some(cfg);
            }
        }
        None
    });
    let hvcc = hvcc.ok_or(Error::InvalidData("No_hvcC_box"))?;
    let length_size = usize::from(hvcc.length_size_minus_one) + 1;

    let mut out = TryVec::new();
    for array in hvcc.nalu_arrays.iter() {
        for nalu in array.nalus.iter() {
            out.extend_from_slice(&ANNEX_B_START_CODE)?;
            out.extend_from_slice(nalu)?;
        }
    }

    let raw = item_raw_bytes(item_id, meta, mdats)?;
    rewrite_length_prefixed_to_annex_b(&raw, length_size, &mut out)?;

    Ok(out)
}
