//! HEVC SEI payload decoding for auxiliary depth images.
//!
//! Depth auxiliary items (`auxC` type `urn:mpeg:hevc:2015:auxid:1`) carry a
//! `depth_representation_info` SEI message (payload type 177) describing
//! how sample values map to real-world disparity/depth. See HEVC
//! (ITU-T H.265) Annex D and ISO/IEC 23008-12 § 6.5.8 for its use as an
//! auxiliary image type.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitreader::BitReader;

use crate::{Error, Result};

/// Maximum number of leading zero bits accepted while decoding an
/// Exp-Golomb (`uvlc`) code, guarding against a pathological bitstream
/// driving the decoder into an unbounded loop.
const MAX_UVLC_LEADING_ZEROS: u32 = 20;

const SEI_PREFIX: u8 = 39;
const SEI_SUFFIX: u8 = 40;
const DEPTH_REPRESENTATION_INFO: u32 = 177;

#[derive(Debug, Default, Clone, Copy)]
pub struct DepthRepresentationInfo {
    pub depth_representation_type: u32,
    pub disparity_reference_view: u32,
    pub z_near: Option<f64>,
    pub z_far: Option<f64>,
    pub d_min: Option<f64>,
    pub d_max: Option<f64>,
}

fn read_uvlc(br: &mut BitReader) -> Result<u32> {
    let mut leading_zeros = 0u32;
    while !br.read_bool()? {
        leading_zeros += 1;
        if leading_zeros > MAX_UVLC_LEADING_ZEROS {
            return Err(Error::InvalidData("uvlc code exceeds leading-zero bound"));
        }
    }
    if leading_zeros == 0 {
        return Ok(0);
    }
    let value = br.read_u32(leading_zeros as u8)?;
    Ok((1u32 << leading_zeros) - 1 + value)
}

/// Custom fixed-point-ish float used by `depth_representation_info`:
/// sign(1) + exponent(7) + mantissa_len(5, value stored is len-1) +
/// mantissa(mantissa_len bits).
fn read_custom_float(br: &mut BitReader) -> Result<f64> {
    let sign = br.read_bool()?;
    let exponent = br.read_u32(7)?;
    let mantissa_len = br.read_u32(5)? + 1;
    let mantissa = br.read_u32(mantissa_len as u8)?;

    let value = if exponent > 0 {
        2f64.powi(exponent as i32 - 31)
            * (1.0 + f64::from(mantissa) / 2f64.powi(mantissa_len as i32))
    } else {
        2f64.powi(-(30 + mantissa_len as i32)) * f64::from(mantissa)
    };

    Ok(if sign { -value } else { value })
}

fn read_depth_representation_info(br: &mut BitReader) -> Result<DepthRepresentationInfo> {
    let mut info = DepthRepresentationInfo::default();

    let z_near_present = br.read_bool()?;
    let z_far_present = br.read_bool()?;
    let d_min_present = br.read_bool()?;
    let d_max_present = br.read_bool()?;

    info.depth_representation_type = read_uvlc(br)?;
    if d_min_present || d_max_present {
        info.disparity_reference_view = read_uvlc(br)?;
    }
    if z_near_present {
        info.z_near = Some(read_custom_float(br)?);
    }
    if z_far_present {
        info.z_far = Some(read_custom_float(br)?);
    }
    if d_min_present {
        info.d_min = Some(read_custom_float(br)?);
    }
    if d_max_present {
        info.d_max = Some(read_custom_float(br)?);
    }

    Ok(info)
}

/// Scan the extracted Annex-B elementary stream of a depth auxiliary image
/// for a `depth_representation_info` SEI message and decode it, if present.
pub(crate) fn decode_depth_representation_info(
    annex_b: &[u8],
) -> Result<Option<DepthRepresentationInfo>> {
    let mut pos = 0usize;
    while pos + 4 <= annex_b.len() {
        // Find the next Annex-B start code.
        if &annex_b[pos..pos + 3] == [0, 0, 1] {
            pos += 3;
        } else if pos + 4 <= annex_b.len() && annex_b[pos..pos + 4] == [0, 0, 0, 1] {
            pos += 4;
        } else {
            pos += 1;
            continue;
        }

        if pos + 2 > annex_b.len() {
            break;
        }
        let nal_type = (annex_b[pos] >> 1) & 0x3f;
        let nal_end = find_next_start_code(annex_b, pos).unwrap_or(annex_b.len());

        if nal_type == SEI_PREFIX || nal_type == SEI_SUFFIX {
            if let Some(info) = scan_sei_nal(&annex_b[pos + 2..nal_end])? {
                return Ok(Some(info));
            }
        }

        pos = nal_end;
    }
    Ok(None)
}

fn find_next_start_code(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && (data[i + 2] == 1 || data[i + 2] == 0) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// `payload_id`/`payload_size` are coded as a run of 0xFF bytes followed by
/// a terminal byte, per HEVC Annex D.2.1/D.3.1.
fn read_sei_varint(data: &[u8], pos: &mut usize) -> Option<u32> {
    let mut value = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        value += u32::from(byte);
        if byte != 0xff {
            break;
        }
    }
    Some(value)
}

fn scan_sei_nal(data: &[u8]) -> Result<Option<DepthRepresentationInfo>> {
    let mut pos = 0usize;
    while pos < data.len() {
        let Some(payload_id) = read_sei_varint(data, &mut pos) else {
            break;
        };
        let Some(payload_size) = read_sei_varint(data, &mut pos) else {
            break;
        };
        let payload_size = payload_size as usize;
        if pos + payload_size > data.len() {
            break;
        }
        if payload_id == DEPTH_REPRESENTATION_INFO {
            let mut br = BitReader::new(&data[pos..pos + payload_size]);
            return Ok(Some(read_depth_representation_info(&mut br)?));
        }
        pos += payload_size;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uvlc_zero_is_single_bit() {
        let data = [0b1000_0000u8];
        let mut br = BitReader::new(&data);
        assert_eq!(read_uvlc(&mut br).unwrap(), 0);
    }

    #[test]
    fn uvlc_small_values() {
        // "010" -> leading_zeros=1, value bit=0 -> 2^1-1+0 = 1
        let data = [0b0100_0000u8];
        let mut br = BitReader::new(&data);
        assert_eq!(read_uvlc(&mut br).unwrap(), 1);
    }

    #[test]
    fn uvlc_rejects_runaway_zeros() {
        let data = [0u8; 4];
        let mut br = BitReader::new(&data);
        assert!(read_uvlc(&mut br).is_err());
    }

    #[test]
    fn no_depth_sei_in_plain_stream() {
        let annex_b = [0, 0, 0, 1, 0x26, 0x01, 0xAA, 0xBB];
        assert!(decode_depth_representation_info(&annex_b).unwrap().is_none());
    }
}
