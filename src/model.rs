//! Interpretation of the `meta` box subtree into a graph of images: pass 1
//! registers image items, pass 2 resolves references (thumbnail, alpha,
//! depth, Exif) and applies geometry properties (`ispe`, `clap`, `irot`).
//!
//! See ISO/IEC 23008-12 § 6.5, § 7, § 9.5 and the two-pass construction
//! used by reference HEIF readers.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::boxes::FourCC;
use crate::meta::{Fraction, HeifMeta, ImageProperty};
use crate::{Error, Result, TryVec};

/// Auxiliary image type URNs recognized for alpha and depth channels.
/// See ISO/IEC 23008-12 § 6.5.8 and MIAF (ISO/IEC 23000-22) § 7.3.5.2.
const AUX_TYPE_ALPHA_AVC: &[u8] = b"urn:mpeg:avc:2015:auxid:1";
const AUX_TYPE_ALPHA_HEVC: &[u8] = b"urn:mpeg:hevc:2015:auxid:1";
const AUX_TYPE_DEPTH: &[u8] = b"urn:mpeg:hevc:2015:auxid:2";

/// A single image entity in the item graph, with its geometry fully
/// resolved.
#[derive(Debug)]
pub struct HeifImage {
    pub item_id: u32,
    pub item_type: FourCC,
    pub hidden: bool,
    pub is_primary: bool,
    /// False for items that are only reachable as a thumbnail/aux/tile of
    /// another item.
    pub is_top_level: bool,
    pub width: u32,
    pub height: u32,
    pub rotation_quarter_turns: u8,
    pub mirror_axis: Option<u8>,
    pub clean_aperture: Option<CleanApertureRect>,
    pub thumbnail_of: TryVec<u32>,
    pub alpha_for: Option<u32>,
    pub depth_for: Option<u32>,
    pub exif_item_id: Option<u32>,
    pub premultiplied_alpha: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CleanApertureRect {
    pub width: u32,
    pub height: u32,
    pub horiz_off: i64,
    pub vert_off: i64,
}

/// An `ImageGrid` item descriptor.
/// See ISO/IEC 23008-12 § 6.6.2.3.2.
#[derive(Debug)]
pub struct GridDescriptor {
    pub rows: u32,
    pub columns: u32,
    pub output_width: u32,
    pub output_height: u32,
}

/// An `ImageOverlay` item descriptor.
/// See ISO/IEC 23008-12 § 6.6.2.3.3.
#[derive(Debug)]
pub struct OverlayDescriptor {
    pub background_color: [u16; 4],
    pub output_width: u32,
    pub output_height: u32,
    pub offsets: TryVec<(i32, i32)>,
}

/// True for item types this parser treats as images (able to carry
/// `ispe`/`clap`/`irot` and participate in the primary-image selection).
pub(crate) fn item_type_is_image(item_type: FourCC) -> bool {
    item_type == b"hvc1" || item_type == b"grid" || item_type == b"iden" || item_type == b"iovl"
}

/// Parse the data payload of a `grid` item.
/// See ISO/IEC 23008-12 § 6.6.2.3.2.
pub(crate) fn parse_grid(data: &[u8]) -> Result<GridDescriptor> {
    if data.len() < 8 {
        return Err(Error::InvalidData("Invalid_grid_data"));
    }
    let _version = data[0];
    let flags = data[1];
    let rows = u32::from(data[2]) + 1;
    let columns = u32::from(data[3]) + 1;

    let (output_width, output_height) = if flags & 1 != 0 {
        if data.len() < 12 {
            return Err(Error::InvalidData("Invalid_grid_data"));
        }
        let width = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let height = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        (width, height)
    } else {
        let width = u32::from(u16::from_be_bytes([data[4], data[5]]));
        let height = u32::from(u16::from_be_bytes([data[6], data[7]]));
        (width, height)
    };

    Ok(GridDescriptor {
        rows,
        columns,
        output_width,
        output_height,
    })
}

/// Parse the data payload of an `iovl` item.
/// See ISO/IEC 23008-12 § 6.6.2.3.3.
pub(crate) fn parse_overlay(data: &[u8], num_images: usize) -> Result<OverlayDescriptor> {
    if data.len() < 2 {
        return Err(Error::InvalidData("Invalid_overlay_data"));
    }
    let version = data[0];
    if version != 0 {
        return Err(Error::Unsupported("Unsupported_data_version"));
    }
    let flags = data[1];
    let field_len = if flags & 1 != 0 { 4usize } else { 2usize };

    let needed = 2 + 4 * 2 + 2 * field_len + num_images * 2 * field_len;
    if data.len() < needed {
        return Err(Error::InvalidData("Invalid_overlay_data"));
    }

    let mut pos = 2usize;
    let mut background_color = [0u16; 4];
    for c in background_color.iter_mut() {
        *c = u16::from_be_bytes([data[pos], data[pos + 1]]);
        pos += 2;
    }

    let read_field = |data: &[u8], pos: usize| -> u32 {
        if field_len == 4 {
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
        } else {
            u32::from(u16::from_be_bytes([data[pos], data[pos + 1]]))
        }
    };
    let read_signed_field = |data: &[u8], pos: usize| -> i32 {
        if field_len == 4 {
            read_field(data, pos) as i32
        } else {
            i32::from(i16::from_be_bytes([data[pos], data[pos + 1]]))
        }
    };

    let output_width = read_field(data, pos);
    pos += field_len;
    let output_height = read_field(data, pos);
    pos += field_len;

    let mut offsets = TryVec::with_capacity(num_images)?;
    for _ in 0..num_images {
        let x = read_signed_field(data, pos);
        pos += field_len;
        let y = read_signed_field(data, pos);
        pos += field_len;
        offsets.push((x, y))?;
    }

    Ok(OverlayDescriptor {
        background_color,
        output_width,
        output_height,
        offsets,
    })
}

/// Compute the clean-aperture rectangle relative to the full (pre-crop)
/// image, rounding half away from the picture center per the reference
/// clean-aperture derivation.
pub(crate) fn apply_clean_aperture(
    full_width: u32,
    full_height: u32,
    width: Fraction,
    height: Fraction,
    horiz_off: Fraction,
    vert_off: Fraction,
) -> Result<CleanApertureRect> {
    let clean_width = width.round();
    let clean_height = height.round();
    if clean_width <= 0 || clean_height <= 0 {
        return Err(Error::InvalidData("Invalid_clean_aperture"));
    }

    let pic_center_x = Fraction {
        numerator: i64::from(full_width) - 1,
        denominator: 1,
    }
    .div_i64(2)
    .add(horiz_off);
    let pic_center_y = Fraction {
        numerator: i64::from(full_height) - 1,
        denominator: 1,
    }
    .div_i64(2)
    .add(vert_off);

    let left = pic_center_x.sub(Fraction {
        numerator: clean_width - 1,
        denominator: 1,
    }
    .div_i64(2));
    let top = pic_center_y.sub(Fraction {
        numerator: clean_height - 1,
        denominator: 1,
    }
    .div_i64(2));

    Ok(CleanApertureRect {
        width: clean_width as u32,
        height: clean_height as u32,
        horiz_off: left.round(),
        vert_off: top.round(),
    })
}

/// Two-pass interpretation of a parsed `meta` box into the item graph.
/// Pass 1 registers every image item and locates the primary item. Pass 2
/// resolves `iref` thumbnail/auxiliary/Exif relationships and applies
/// `ispe`/`clap`/`irot` properties.
pub(crate) fn interpret_items(meta: &HeifMeta) -> Result<TryVec<HeifImage>> {
    // Pass 1: register every image-typed item.
    let mut images = TryVec::new();
    for info in meta.item_infos.iter() {
        if !item_type_is_image(info.item_type) {
            continue;
        }
        images.push(HeifImage {
            item_id: info.item_id,
            item_type: info.item_type,
            hidden: info.hidden,
            is_primary: info.item_id == meta.primary_item_id,
            is_top_level: true,
            width: 0,
            height: 0,
            rotation_quarter_turns: 0,
            mirror_axis: None,
            clean_aperture: None,
            thumbnail_of: TryVec::new(),
            alpha_for: None,
            depth_for: None,
            exif_item_id: None,
            premultiplied_alpha: false,
        })?;
    }

    if !images.iter().any(|img| img.is_primary) {
        return Err(Error::InvalidData("Nonexisting_image_referenced"));
    }

    // Every registered image must have at least one ipma association;
    // an item that never shows up in the associated-properties list
    // (no ipma entry, or an entry with zero associations) is rejected.
    for img in images.iter() {
        if !meta.properties.iter().any(|(id, _)| *id == img.item_id) {
            return Err(Error::InvalidData("No_properties_assigned_to_item"));
        }
    }

    // Pass 2a: resolve 'thmb' (thumbnail of), 'auxl' (auxiliary of) and
    // 'cdsc' (content description, i.e. Exif attached to) references.
    // An item that is the target of a thmb/auxl reference is not
    // independently presentable and is removed from the top-level set.
    for iref in meta.item_references.iter() {
        if iref.item_type == b"thmb" {
            if let Some(idx) = images.iter().position(|i| i.item_id == iref.from_item_id) {
                images[idx].is_top_level = false;
                let target = iref.to_item_id;
                if let Some(parent) = images.iter_mut().find(|i| i.item_id == target) {
                    parent.thumbnail_of.push(iref.from_item_id)?;
                }
            }
        } else if iref.item_type == b"auxl" {
            let aux_item_id = iref.from_item_id;
            let parent_id = iref.to_item_id;
            let is_alpha = meta.properties.iter().any(|(id, prop)| {
                *id == aux_item_id
                    && matches!(prop, ImageProperty::AuxiliaryType(urn) if urn.as_slice() == AUX_TYPE_ALPHA_AVC || urn.as_slice() == AUX_TYPE_ALPHA_HEVC)
            });
            let is_depth = meta.properties.iter().any(|(id, prop)| {
                *id == aux_item_id
                    && matches!(prop, ImageProperty::AuxiliaryType(urn) if urn.as_slice() == AUX_TYPE_DEPTH)
            });
            if let Some(idx) = images.iter().position(|i| i.item_id == aux_item_id) {
                images[idx].is_top_level = false;
                if is_alpha {
                    images[idx].alpha_for = Some(parent_id);
                } else if is_depth {
                    images[idx].depth_for = Some(parent_id);
                }
            }
        } else if iref.item_type == b"cdsc" {
            let metadata_item_id = iref.from_item_id;
            let target = iref.to_item_id;
            if let Some(parent) = images.iter_mut().find(|i| i.item_id == target) {
                parent.exif_item_id = Some(metadata_item_id);
            }
        }
    }

    // Premultiplied-alpha flag: 'prem' reference from the color image to
    // its alpha auxiliary image. See MIAF (ISO/IEC 23000-22) § 7.3.5.2.
    for iref in meta.item_references.iter() {
        if iref.item_type != b"prem" {
            continue;
        }
        let alpha_matches = images
            .iter()
            .any(|i| i.item_id == iref.to_item_id && i.alpha_for == Some(iref.from_item_id));
        if alpha_matches {
            if let Some(img) = images.iter_mut().find(|i| i.item_id == iref.from_item_id) {
                img.premultiplied_alpha = true;
            }
        }
    }

    // Pass 2b: apply ispe / clap / irot / imir properties.
    const MAX_DIMENSION: u32 = i32::MAX as u32;
    for (item_id, prop) in meta.properties.iter() {
        let Some(img) = images.iter_mut().find(|i| i.item_id == *item_id) else {
            continue;
        };
        match prop {
            ImageProperty::SpatialExtents { width, height } => {
                if *width == 0 || *height == 0 || *width > MAX_DIMENSION || *height > MAX_DIMENSION
                {
                    return Err(Error::InvalidData("ispe dimensions out of range"));
                }
                img.width = *width;
                img.height = *height;
            }
            ImageProperty::Rotation(turns) => {
                img.rotation_quarter_turns = *turns;
            }
            ImageProperty::Mirror(axis) => {
                img.mirror_axis = Some(*axis);
            }
            _ => {}
        }
    }

    // 'irot' of 90 or 270 degrees swaps the effective width/height: an
    // 'ispe' of 640x480 followed by 'irot=90' is presented as 480x640.
    // See ISO/IEC 23008-12 § 6.5.10.1 and spec boundary case "ispe
    // immediately followed by irot=90/270".
    for img in images.iter_mut() {
        if img.rotation_quarter_turns % 2 == 1 {
            let swapped = (img.height, img.width);
            img.width = swapped.0;
            img.height = swapped.1;
        }
    }

    // clap is applied after ispe/irot so the clean-aperture rectangle is
    // computed against the already-rotated extents, matching the order
    // 'ispe' -> 'irot'/'imir' -> 'clap' defined for derived properties.
    for (item_id, prop) in meta.properties.iter() {
        if let ImageProperty::CleanAperture {
            width,
            height,
            horiz_off,
            vert_off,
        } = prop
        {
            let Some(img) = images.iter_mut().find(|i| i.item_id == *item_id) else {
                continue;
            };
            if img.width != 0 && img.height != 0 {
                img.clean_aperture = Some(apply_clean_aperture(
                    img.width,
                    img.height,
                    *width,
                    *height,
                    *horiz_off,
                    *vert_off,
                )?);
            }
        }
    }

    if images.len() > crate::MAX_ILOC_ITEMS {
        return Err(Error::OutOfMemory);
    }

    Ok(images)
}
