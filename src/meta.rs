//! Parsing of the `meta` box subtree: item info, item location, item
//! properties and item references.
//!
//! See ISO/IEC 14496-12 § 8.11 and ISO/IEC 23008-12 § 9.3/§ 9.5.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::convert::{TryFrom, TryInto};
use std::io::Read;
use std::ops::{Range, RangeFrom};

use bitreader::BitReader;
use byteorder::ReadBytesExt;

use crate::boxes::{BoxType, FourCC};
use crate::{
    be_u16, be_u32, read_fullbox_extra, read_fullbox_version_no_flags, skip_box_content,
    skip_box_remain, BMFFBox, Error, Offset, Result, ToUsize, TryString, TryVec,
};

/// Used for `infe` boxes within `iinf`.
/// See ISO/IEC 14496-12 § 8.11.6.
#[derive(Debug)]
pub(crate) struct ItemInfoEntry {
    pub(crate) item_id: u32,
    pub(crate) item_type: FourCC,
    pub(crate) hidden: bool,
    pub(crate) item_name: TryString,
}

/// See ISO/IEC 14496-12 § 8.11.12.
#[derive(Debug)]
pub(crate) struct ItemReferenceEntry {
    pub(crate) item_type: FourCC,
    pub(crate) from_item_id: u32,
    pub(crate) to_item_id: u32,
}

/// Potential sizes (in bytes) of variable-sized fields of the `iloc` box.
/// See ISO/IEC 14496-12 § 8.11.3.
#[derive(Debug)]
pub(crate) enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    fn to_bits(&self) -> u8 {
        match self {
            IlocFieldSize::Zero => 0,
            IlocFieldSize::Four => 32,
            IlocFieldSize::Eight => 64,
        }
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidData("value must be in the set {0, 4, 8}")),
        }
    }
}

#[derive(PartialEq)]
pub(crate) enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported("unsupported version in 'iloc' box")),
        }
    }
}

/// Used for `iloc` boxes. `base_offset` is folded into the ranges in
/// `extents`. `data_reference_index` is omitted; only 0 (this file) is
/// supported.
#[derive(Debug)]
pub(crate) struct ItemLocationBoxItem {
    pub(crate) item_id: u32,
    pub(crate) construction_method: ConstructionMethod,
    pub(crate) extents: TryVec<ItemLocationBoxExtent>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConstructionMethod {
    File,
    Idat,
}

#[derive(Clone, Debug)]
pub(crate) struct ItemLocationBoxExtent {
    pub(crate) extent_range: ExtentRange,
}

#[derive(Clone, Debug)]
pub(crate) enum ExtentRange {
    WithLength(Range<u64>),
    ToEnd(RangeFrom<u64>),
}

impl ExtentRange {
    pub(crate) fn start(&self) -> u64 {
        match self {
            Self::WithLength(r) => r.start,
            Self::ToEnd(r) => r.start,
        }
    }
}

/// A rational number, as used by the `clap` (clean aperture) property.
/// See ISO/IEC 14496-12 § 12.1.4.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Fraction {
    pub(crate) numerator: i64,
    pub(crate) denominator: i64,
}

impl Fraction {
    fn read<T: ReadBytesExt>(src: &mut T) -> Result<Self> {
        Ok(Fraction {
            numerator: i64::from(be_u32(src)? as i32),
            denominator: i64::from(be_u32(src)? as i32),
        })
    }

    pub(crate) fn add(self, other: Fraction) -> Fraction {
        Fraction {
            numerator: self.numerator * other.denominator + other.numerator * self.denominator,
            denominator: self.denominator * other.denominator,
        }
    }

    pub(crate) fn sub(self, other: Fraction) -> Fraction {
        self.add(Fraction {
            numerator: -other.numerator,
            denominator: other.denominator,
        })
    }

    pub(crate) fn div_i64(self, other: i64) -> Fraction {
        Fraction {
            numerator: self.numerator,
            denominator: self.denominator * other,
        }
    }

    /// Round half away from zero, matching the reference clean-aperture
    /// rounding used to derive the displayed rectangle.
    pub(crate) fn round(self) -> i64 {
        if self.denominator == 0 {
            return 0;
        }
        let half = self.denominator / 2;
        if self.numerator >= 0 {
            (self.numerator + half) / self.denominator
        } else {
            -((-self.numerator + half) / self.denominator)
        }
    }
}

/// Decoded `hvcC` HEVC decoder configuration record.
/// See ISO/IEC 14496-15 § 8.3.3.1.
#[derive(Debug)]
pub(crate) struct HevcConfigBox {
    pub(crate) length_size_minus_one: u8,
    pub(crate) nalu_arrays: TryVec<HvcCNalArray>,
}

#[derive(Debug)]
pub(crate) struct HvcCNalArray {
    pub(crate) nal_unit_type: u8,
    pub(crate) nalus: TryVec<TryVec<u8>>,
}

/// A decoded, but not yet associated, item property.
#[derive(Debug)]
pub(crate) enum ImageProperty {
    /// `ispe`: image spatial extents (width, height before rotation).
    SpatialExtents { width: u32, height: u32 },
    /// `clap`: clean aperture.
    CleanAperture {
        width: Fraction,
        height: Fraction,
        horiz_off: Fraction,
        vert_off: Fraction,
    },
    /// `irot`: 0, 1, 2 or 3 quarter turns counter-clockwise.
    Rotation(u8),
    /// `imir`: axis of mirroring (0 = vertical axis, 1 = horizontal axis).
    Mirror(u8),
    /// `auxC`: auxiliary image type URN.
    AuxiliaryType(TryString),
    /// `pixi`: per-channel bit depths.
    Channels(TryVec<u8>),
    /// `hvcC`: HEVC decoder configuration record.
    HevcConfig(HevcConfigBox),
    /// A recognized but semantically uninteresting property, or one this
    /// parser does not interpret.
    Unsupported,
}

pub(crate) struct Association {
    pub(crate) item_id: u32,
    pub(crate) property_index: u16,
    pub(crate) essential: bool,
}

/// All metadata gathered from one `meta` box.
pub(crate) struct HeifMeta {
    pub(crate) primary_item_id: u32,
    pub(crate) item_infos: TryVec<ItemInfoEntry>,
    pub(crate) iloc_items: TryVec<ItemLocationBoxItem>,
    pub(crate) item_references: TryVec<ItemReferenceEntry>,
    pub(crate) properties: TryVec<(u32, ImageProperty)>,
    /// Inline data referenced by `construction_method == 1` extents.
    pub(crate) idat: TryVec<u8>,
}

/// Parse a `meta` box.
/// See ISO/IEC 14496-12 § 8.11.1, ISO/IEC 23008-12 § 9.3.
pub(crate) fn read_heif_meta<T: Read + Offset>(src: &mut BMFFBox<'_, T>) -> Result<HeifMeta> {
    let version = read_fullbox_version_no_flags(src)?;
    if version != 0 {
        return Err(Error::Unsupported("unsupported meta version"));
    }

    let mut primary_item_id = None;
    let mut item_infos = None;
    let mut iloc_items = None;
    let mut item_references = TryVec::new();
    let mut properties = TryVec::new();
    let mut idat = TryVec::new();
    let mut saw_hdlr = false;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::HandlerBox => {
                let handler_type = read_hdlr(&mut b)?;
                if handler_type != b"pict" {
                    return Err(Error::InvalidData("No_pict_handler"));
                }
                saw_hdlr = true;
            }
            BoxType::ItemInfoBox => {
                if item_infos.is_some() {
                    return Err(Error::InvalidData(
                        "There should be zero or one iinf boxes per ISO 14496-12 § 8.11.6.1",
                    ));
                }
                item_infos = Some(read_iinf(&mut b)?);
            }
            BoxType::ItemLocationBox => {
                if iloc_items.is_some() {
                    return Err(Error::InvalidData(
                        "There should be zero or one iloc boxes per ISO 14496-12 § 8.11.3.1",
                    ));
                }
                iloc_items = Some(read_iloc(&mut b)?);
            }
            BoxType::PrimaryItemBox => {
                if primary_item_id.is_some() {
                    return Err(Error::InvalidData(
                        "There should be zero or one pitm boxes per ISO 14496-12 § 8.11.4.1",
                    ));
                }
                primary_item_id = Some(read_pitm(&mut b)?);
            }
            BoxType::ImageReferenceBox => {
                item_references.append(&mut read_iref(&mut b)?)?;
            }
            BoxType::ImagePropertiesBox => {
                properties = read_iprp(&mut b)?;
            }
            BoxType::ItemDataBox => {
                idat = b.read_into_try_vec()?;
            }
            BoxType::DataInformationBox => {
                read_dinf(&mut b)?;
            }
            BoxType::GroupListBox => {
                skip_box_content(&mut b)?;
            }
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state!(b.content);
    }

    if !saw_hdlr {
        debug!("meta box missing 'hdlr'; continuing per lenient-reader practice");
    }

    let primary_item_id = primary_item_id.ok_or(Error::InvalidData("No_pitm_box"))?;
    let item_infos = item_infos.ok_or(Error::InvalidData("No_iinf_box"))?;

    if !item_infos.iter().any(|x| x.item_id == primary_item_id) {
        return Err(Error::InvalidData("No_or_invalid_primary_image"));
    }

    Ok(HeifMeta {
        primary_item_id,
        item_infos,
        iloc_items: iloc_items.ok_or(Error::InvalidData("No_iloc_box"))?,
        item_references,
        properties,
        idat,
    })
}

/// Parse a Handler Reference Box `hdlr`.
/// See ISO/IEC 14496-12 § 8.4.3.
fn read_hdlr<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FourCC> {
    let _version = read_fullbox_version_no_flags(src)?;
    let _pre_defined = be_u32(src)?;
    let handler_type = be_u32(src)?.into();
    skip_box_remain(src)?;
    Ok(handler_type)
}

/// Parse a Primary Item Box `pitm`.
/// See ISO/IEC 14496-12 § 8.11.4.
fn read_pitm<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<u32> {
    let version = read_fullbox_version_no_flags(src)?;
    let item_id = match version {
        0 => be_u16(src)?.into(),
        1 => be_u32(src)?,
        _ => return Err(Error::Unsupported("unsupported pitm version")),
    };
    Ok(item_id)
}

/// Parse an Item Information Box `iinf`.
/// See ISO/IEC 14496-12 § 8.11.6.
fn read_iinf<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<ItemInfoEntry>> {
    let version = read_fullbox_version_no_flags(src)?;
    match version {
        0 | 1 => (),
        _ => return Err(Error::Unsupported("unsupported iinf version")),
    }

    let entry_count = if version == 0 {
        be_u16(src)?.to_usize()
    } else {
        be_u32(src)?.to_usize()
    };
    let mut item_infos = TryVec::with_capacity(entry_count)?;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        if b.head.name != BoxType::ItemInfoEntry {
            return Err(Error::InvalidData(
                "iinf box should contain only infe boxes",
            ));
        }
        item_infos.push(read_infe(&mut b)?)?;
        check_parser_state!(b.content);
    }

    Ok(item_infos)
}

/// Parse an Item Info Entry `infe`.
/// See ISO/IEC 14496-12 § 8.11.6.2.
fn read_infe<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ItemInfoEntry> {
    let (version, flags) = read_fullbox_extra(src)?;

    // mif1/heic brands require v2/v3; see ISO/IEC 23008-12 § 10.2.1.
    let item_id = match version {
        2 => be_u16(src)?.into(),
        3 => be_u32(src)?,
        _ => return Err(Error::Unsupported("unsupported version in 'infe' box")),
    };

    let item_protection_index = be_u16(src)?;
    if item_protection_index != 0 {
        return Err(Error::Unsupported(
            "protected items (infe.item_protection_index != 0) are not supported",
        ));
    }

    let item_type: FourCC = be_u32(src)?.into();

    let mut item_name = TryString::new();
    loop {
        match src.read_u8()? {
            0 => break,
            c => item_name.push(c)?,
        }
    }

    // content_encoding, then for 'mime' an additional content_type string,
    // or for 'uri ' an item_uri_type string; not interpreted further here.
    if item_type == b"mime" || item_type == b"uri " {
        skip_box_remain(src)?;
    } else {
        skip_box_remain(src)?;
    }

    debug!("infe item_id {} item_type: {}", item_id, item_type);

    Ok(ItemInfoEntry {
        item_id,
        item_type,
        // Bit 0 of the flags field marks a hidden item; see ISO/IEC
        // 14496-12 § 8.11.6.2.
        hidden: flags & 1 != 0,
        item_name,
    })
}

/// Parse an Item Reference Box `iref`.
/// See ISO/IEC 14496-12 § 8.11.12.
fn read_iref<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<ItemReferenceEntry>> {
    let mut entries = TryVec::new();
    let version = read_fullbox_version_no_flags(src)?;
    if version > 1 {
        return Err(Error::Unsupported("iref version"));
    }

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        let from_item_id = if version == 0 {
            be_u16(&mut b)? as u32
        } else {
            be_u32(&mut b)?
        };
        let item_count = be_u16(&mut b)?;
        for _ in 0..item_count {
            let to_item_id = if version == 0 {
                be_u16(&mut b)?.into()
            } else {
                be_u32(&mut b)?
            };
            entries.push(ItemReferenceEntry {
                item_type: b.head.name.into(),
                from_item_id,
                to_item_id,
            })?;
        }
    }
    Ok(entries)
}

/// Parse an Item Properties Box `iprp`.
/// See ISO/IEC 23008-12 § 9.3.1.
fn read_iprp<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<(u32, ImageProperty)>> {
    let mut iter = src.box_iter();
    let mut properties = TryVec::new();
    let mut associations = TryVec::new();

    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ItemPropertyContainerBox => {
                properties = read_ipco(&mut b)?;
            }
            BoxType::ItemPropertyAssociationBox => {
                associations.append(&mut read_ipma(&mut b)?)?;
            }
            _ => return Err(Error::InvalidData("unexpected iprp child")),
        }
    }

    let mut associated = TryVec::new();
    for a in associations {
        let index = match a.property_index {
            0 => continue,
            x => x as usize - 1,
        };
        let prop = properties
            .get(index)
            .ok_or(Error::InvalidData("Ipma_box_references_nonexisting_property"))?;
        // essential=true means a reader that does not understand the
        // property must reject the image; 'Unsupported' is exactly the
        // set of properties this parser does not understand.
        if a.essential && matches!(prop, ImageProperty::Unsupported) {
            return Err(Error::Unsupported("Unsupported_essential_property"));
        }
        if !matches!(prop, ImageProperty::Unsupported) {
            associated.push((a.item_id, prop.clone_into()?))?;
        }
    }
    Ok(associated)
}

impl ImageProperty {
    fn clone_into(&self) -> Result<Self> {
        Ok(match self {
            Self::SpatialExtents { width, height } => Self::SpatialExtents {
                width: *width,
                height: *height,
            },
            Self::CleanAperture {
                width,
                height,
                horiz_off,
                vert_off,
            } => Self::CleanAperture {
                width: *width,
                height: *height,
                horiz_off: *horiz_off,
                vert_off: *vert_off,
            },
            Self::Rotation(r) => Self::Rotation(*r),
            Self::Mirror(m) => Self::Mirror(*m),
            Self::AuxiliaryType(s) => {
                use fallible_collections::TryClone;
                Self::AuxiliaryType(s.try_clone()?)
            }
            Self::Channels(c) => {
                use fallible_collections::TryClone;
                Self::Channels(c.try_clone()?)
            }
            Self::HevcConfig(cfg) => Self::HevcConfig(cfg.try_clone()?),
            Self::Unsupported => Self::Unsupported,
        })
    }
}

impl HevcConfigBox {
    /// `hvcC` is shared (by `ipma` association) across every item it
    /// applies to, so each association needs its own owned copy.
    fn try_clone(&self) -> Result<Self> {
        let mut nalu_arrays = TryVec::with_capacity(self.nalu_arrays.len())?;
        for array in self.nalu_arrays.iter() {
            let mut nalus = TryVec::with_capacity(array.nalus.len())?;
            for nalu in array.nalus.iter() {
                let mut copy = TryVec::with_capacity(nalu.len())?;
                copy.extend_from_slice(nalu)?;
                nalus.push(copy)?;
            }
            nalu_arrays.push(HvcCNalArray {
                nal_unit_type: array.nal_unit_type,
                nalus,
            })?;
        }
        Ok(HevcConfigBox {
            length_size_minus_one: self.length_size_minus_one,
            nalu_arrays,
        })
    }
}

/// Parse an Item Property Association Box `ipma`.
/// See ISO/IEC 23008-12 § 9.3.3.
fn read_ipma<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<Association>> {
    let (version, flags) = read_fullbox_extra(src)?;

    let mut associations = TryVec::new();

    let entry_count = be_u32(src)?;
    for _ in 0..entry_count {
        let item_id = if version == 0 {
            be_u16(src)?.into()
        } else {
            be_u32(src)?
        };
        let association_count = src.read_u8()?;
        for _ in 0..association_count {
            let first_byte = src.read_u8()?;
            let essential = first_byte & 0x80 != 0;
            let value = first_byte & 0x7f;
            let property_index = if flags & 1 != 0 {
                (u16::from(value) << 8) | u16::from(src.read_u8()?)
            } else {
                u16::from(value)
            };
            associations.push(Association {
                item_id,
                property_index,
                essential,
            })?;
        }
    }
    Ok(associations)
}

/// Parse an Item Property Container Box `ipco`.
/// See ISO/IEC 23008-12 § 9.3.2.
fn read_ipco<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<ImageProperty>> {
    let mut properties = TryVec::new();

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        // Must push for every property, recognized or not, to keep indices
        // in sync with 'ipma' property_index references.
        properties.push(match b.head.name {
            BoxType::ImageSpatialExtentsProperty => read_ispe(&mut b)?,
            BoxType::CleanApertureProperty => read_clap(&mut b)?,
            BoxType::ImageRotation => read_irot(&mut b)?,
            BoxType::ImageMirror => read_imir(&mut b)?,
            BoxType::AuxiliaryTypeProperty => ImageProperty::AuxiliaryType(read_auxc(&mut b)?),
            BoxType::PixelInformationBox => ImageProperty::Channels(read_pixi(&mut b)?),
            BoxType::HEVCConfigurationBox => ImageProperty::HevcConfig(read_hvcc(&mut b)?),
            _ => {
                skip_box_remain(&mut b)?;
                ImageProperty::Unsupported
            }
        })?;
    }
    Ok(properties)
}

/// Parse an Image Spatial Extents Property `ispe`.
/// See ISO/IEC 23008-12 § 6.5.3.
fn read_ispe<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ImageProperty> {
    let version = read_fullbox_version_no_flags(src)?;
    if version != 0 {
        return Err(Error::Unsupported("ispe version"));
    }
    let width = be_u32(src)?;
    let height = be_u32(src)?;
    Ok(ImageProperty::SpatialExtents { width, height })
}

/// Parse a Clean Aperture Property `clap`.
/// See ISO/IEC 14496-12 § 12.1.4.
fn read_clap<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ImageProperty> {
    let width = Fraction::read(src)?;
    let height = Fraction::read(src)?;
    let horiz_off = Fraction::read(src)?;
    let vert_off = Fraction::read(src)?;
    Ok(ImageProperty::CleanAperture {
        width,
        height,
        horiz_off,
        vert_off,
    })
}

/// Parse an Image Rotation Property `irot`.
/// See ISO/IEC 23008-12 § 6.5.10.
fn read_irot<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ImageProperty> {
    let b = src.read_u8()? & 0x3;
    Ok(ImageProperty::Rotation(b))
}

/// Parse an Image Mirror Property `imir`.
/// See ISO/IEC 23008-12 § 6.5.12.
fn read_imir<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ImageProperty> {
    let b = src.read_u8()? & 0x1;
    Ok(ImageProperty::Mirror(b))
}

/// Parse an Auxiliary Type Property `auxC`.
/// See ISO/IEC 23008-12 § 6.5.8.
fn read_auxc<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryString> {
    let version = read_fullbox_version_no_flags(src)?;
    if version != 0 {
        return Err(Error::Unsupported("auxC version"));
    }

    let mut aux = TryString::new();
    loop {
        match src.read_u8()? {
            0 => break,
            c => aux.push(c)?,
        }
    }
    Ok(aux)
}

/// Parse a Pixel Information Property `pixi`.
/// See ISO/IEC 23008-12 § 6.5.6.
fn read_pixi<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<u8>> {
    use fallible_collections::TryRead;

    let version = read_fullbox_version_no_flags(src)?;
    if version != 0 {
        return Err(Error::Unsupported("pixi version"));
    }

    let num_channels = src.read_u8()?.into();
    let mut channels = TryVec::with_capacity(num_channels)?;
    let num_channels_read = src.try_read_to_end(&mut channels)?;

    if num_channels_read != num_channels {
        return Err(Error::InvalidData("invalid num_channels"));
    }
    Ok(channels)
}

/// Parse a HEVC Decoder Configuration Record `hvcC`.
/// See ISO/IEC 14496-15 § 8.3.3.1.
fn read_hvcc<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<HevcConfigBox> {
    let data = src.read_into_try_vec()?;
    if data.len() < 23 {
        return Err(Error::InvalidData("hvcC too short"));
    }
    let length_size_minus_one = data[21] & 0x3;
    let num_arrays = data[22];

    let mut nalu_arrays = TryVec::with_capacity(num_arrays.to_usize())?;
    let mut pos = 23usize;
    for _ in 0..num_arrays {
        if pos + 3 > data.len() {
            return Err(Error::InvalidData("hvcC nalu array truncated"));
        }
        let nal_unit_type = data[pos] & 0x3f;
        let num_nalus = u16::from_be_bytes([data[pos + 1], data[pos + 2]]);
        pos += 3;
        let mut nalus = TryVec::with_capacity(num_nalus.to_usize())?;
        for _ in 0..num_nalus {
            if pos + 2 > data.len() {
                return Err(Error::InvalidData("hvcC nalu truncated"));
            }
            let nal_len = u16::from_be_bytes([data[pos], data[pos + 1]]).to_usize();
            pos += 2;
            if pos + nal_len > data.len() {
                return Err(Error::InvalidData("hvcC nalu truncated"));
            }
            let mut nalu = TryVec::with_capacity(nal_len)?;
            nalu.extend_from_slice(&data[pos..pos + nal_len])?;
            pos += nal_len;
            nalus.push(nalu)?;
        }
        nalu_arrays.push(HvcCNalArray {
            nal_unit_type,
            nalus,
        })?;
    }

    Ok(HevcConfigBox {
        length_size_minus_one,
        nalu_arrays,
    })
}

/// Parse an Item Location Box `iloc`.
/// See ISO/IEC 14496-12 § 8.11.3.
fn read_iloc<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<TryVec<ItemLocationBoxItem>> {
    let version: IlocVersion = read_fullbox_version_no_flags(src)?.try_into()?;

    let iloc = src.read_into_try_vec()?;
    let mut iloc = BitReader::new(&iloc);

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: Option<IlocFieldSize> = match version {
        IlocVersion::One | IlocVersion::Two => Some(iloc.read_u8(4)?.try_into()?),
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            None
        }
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };

    if item_count.to_usize() > crate::MAX_ILOC_ITEMS {
        return Err(Error::Unsupported("too many iloc items"));
    }

    let mut items = TryVec::with_capacity(item_count.to_usize())?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };

        // Version 0 has no construction_method field; version 0 implies
        // file offsets. "For maximum compatibility, version 0 of this box
        // should be used in preference to version 1 with
        // construction_method==0, or version 2 when possible."
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => {
                        return Err(Error::Unsupported(
                            "construction_method 'item_offset' is not supported",
                        ))
                    }
                    _ => {
                        return Err(Error::InvalidData(
                        "construction_method is taken from the set 0, 1 or 2 per ISO 14496-12 § 8.11.3.3",
                    ))
                    }
                }
            }
        };

        let data_reference_index = iloc.read_u16(16)?;
        if data_reference_index != 0 {
            return Err(Error::Unsupported(
                "external file references (iloc.data_reference_index != 0) are not supported",
            ));
        }

        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::InvalidData(
                "extent_count must have a value 1 or greater per ISO 14496-12 § 8.11.3.3",
            ));
        }
        if extent_count.to_usize() > crate::MAX_EXTENTS_PER_ITEM {
            return Err(Error::Unsupported("too many extents for one item"));
        }

        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;

        for _ in 0..extent_count {
            let _extent_index = match &index_size {
                None | Some(IlocFieldSize::Zero) => None,
                Some(index_size) => {
                    debug_assert!(version == IlocVersion::One || version == IlocVersion::Two);
                    Some(iloc.read_u64(index_size.to_bits())?)
                }
            };

            // "If the offset is not identified (the field has a length of
            // zero), then the beginning of the source (offset 0) is
            // implied"; follows from BitReader::read_u64(0) -> 0.
            let extent_offset = iloc.read_u64(offset_size.to_bits())?;
            let extent_length = iloc.read_u64(length_size.to_bits())?;

            let start = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData("offset calculation overflow"))?;
            let extent_range = if extent_length == 0 {
                ExtentRange::ToEnd(RangeFrom { start })
            } else {
                let end = start
                    .checked_add(extent_length)
                    .ok_or(Error::InvalidData("end calculation overflow"))?;
                ExtentRange::WithLength(Range { start, end })
            };

            extents.push(ItemLocationBoxExtent { extent_range })?;
        }

        items.push(ItemLocationBoxItem {
            item_id,
            construction_method,
            extents,
        })?;
    }

    if iloc.remaining() == 0 {
        Ok(items)
    } else {
        Err(Error::InvalidData("invalid iloc size"))
    }
}

/// Parse a Data Information Box `dinf`; only the trivial "this file"
/// data reference is supported.
/// See ISO/IEC 14496-12 § 8.7.1.
fn read_dinf<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::DataReferenceBox => read_dref(&mut b)?,
            _ => skip_box_content(&mut b)?,
        }
        check_parser_state!(b.content);
    }
    Ok(())
}

/// Parse a Data Reference Box `dref`; entries other than a single empty
/// `url ` (meaning "data is in this file") are rejected, since item
/// extraction assumes the whole byte stream is local.
/// See ISO/IEC 14496-12 § 8.7.2.
fn read_dref<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let _version = read_fullbox_version_no_flags(src)?;
    let entry_count = be_u32(src)?;

    let mut iter = src.box_iter();
    let mut seen = 0u32;
    while let Some(mut b) = iter.next_box()? {
        seen += 1;
        match b.head.name {
            BoxType::DataEntryUrlBox => {
                let (_version, flags) = read_fullbox_extra(&mut b)?;
                if flags & 1 == 0 {
                    return Err(Error::Unsupported(
                        "external (non-self-contained) data references are not supported",
                    ));
                }
            }
            _ => return Err(Error::Unsupported("unsupported dref entry type")),
        }
        check_parser_state!(b.content);
    }

    if seen != entry_count {
        return Err(Error::InvalidData("dref entry_count mismatch"));
    }
    Ok(())
}
