//! Box type identifiers (4-character codes) used throughout the container.
//!
//! See ISO/IEC 14496-12 § 4.2 for the general box structure and
//! ISO/IEC 23008-12 § 6.5/§ 8/§ 9 for the HEIF-specific boxes.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// A 4-byte box type, handler type or brand, compared and displayed as ASCII
/// where possible.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FourCC {
    pub(crate) value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(v: u32) -> FourCC {
        FourCC {
            value: v.to_be_bytes(),
        }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> FourCC {
        FourCC::from(u32::from(t))
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> FourCC {
        FourCC { value }
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        &self.value == *other
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:x?}", self.value),
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// Box types recognized by this parser. Anything else is kept as
/// [`BoxType::UnknownBox`] and skipped by the generic child-box loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoxType {
    FileTypeBox,
    MetadataBox,
    HandlerBox,
    PrimaryItemBox,
    ItemInfoBox,
    ItemInfoEntry,
    ItemLocationBox,
    ImageReferenceBox,
    ImagePropertiesBox,
    ItemPropertyContainerBox,
    ItemPropertyAssociationBox,
    ItemDataBox,
    MediaDataBox,
    UuidBox,
    ImageSpatialExtentsProperty,
    CleanApertureProperty,
    ImageRotation,
    ImageMirror,
    AuxiliaryTypeProperty,
    PixelInformationBox,
    HEVCConfigurationBox,
    DataInformationBox,
    DataReferenceBox,
    DataEntryUrlBox,
    GroupListBox,
    UnknownBox(u32),
}

macro_rules! box_type_table {
    ( $( $fourcc:expr => $variant:ident ),* $(,)? ) => {
        impl From<u32> for BoxType {
            fn from(v: u32) -> BoxType {
                match &v.to_be_bytes() {
                    $( $fourcc => BoxType::$variant, )*
                    _ => BoxType::UnknownBox(v),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(t: BoxType) -> u32 {
                match t {
                    $( BoxType::$variant => u32::from_be_bytes(*$fourcc), )*
                    BoxType::UnknownBox(v) => v,
                }
            }
        }
    };
}

box_type_table! {
    b"ftyp" => FileTypeBox,
    b"meta" => MetadataBox,
    b"hdlr" => HandlerBox,
    b"pitm" => PrimaryItemBox,
    b"iinf" => ItemInfoBox,
    b"infe" => ItemInfoEntry,
    b"iloc" => ItemLocationBox,
    b"iref" => ImageReferenceBox,
    b"iprp" => ImagePropertiesBox,
    b"ipco" => ItemPropertyContainerBox,
    b"ipma" => ItemPropertyAssociationBox,
    b"idat" => ItemDataBox,
    b"mdat" => MediaDataBox,
    b"uuid" => UuidBox,
    b"ispe" => ImageSpatialExtentsProperty,
    b"clap" => CleanApertureProperty,
    b"irot" => ImageRotation,
    b"imir" => ImageMirror,
    b"auxC" => AuxiliaryTypeProperty,
    b"pixi" => PixelInformationBox,
    b"hvcC" => HEVCConfigurationBox,
    b"dinf" => DataInformationBox,
    b"dref" => DataReferenceBox,
    b"url " => DataEntryUrlBox,
    b"grpl" => GroupListBox,
}

// Item-reference type boxes nested inside `iref` (`thmb`, `auxl`, `cdsc`,
// `dimg`, ...) and item types stored in `infe` (`hvc1`, `grid`, `iovl`, ...)
// are read directly as `FourCC` rather than matched as a `BoxType`, since
// they never appear as a parseable box header in their own right.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_known_box_types() {
        assert_eq!(BoxType::from(u32::from_be_bytes(*b"meta")), BoxType::MetadataBox);
        assert_eq!(BoxType::from(u32::from_be_bytes(*b"iloc")), BoxType::ItemLocationBox);
        assert_eq!(u32::from(BoxType::MetadataBox), u32::from_be_bytes(*b"meta"));
    }

    #[test]
    fn unknown_box_type_preserved() {
        let v = u32::from_be_bytes(*b"zzzz");
        assert_eq!(BoxType::from(v), BoxType::UnknownBox(v));
    }

    #[test]
    fn fourcc_display() {
        let fourcc = FourCC::from(u32::from_be_bytes(*b"ftyp"));
        assert_eq!(format!("{}", fourcc), "ftyp");
    }
}
