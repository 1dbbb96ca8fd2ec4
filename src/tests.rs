//! Internal unit tests for the box-tree and item-model layers.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Cursor;

use crate::boxes::{BoxType, FourCC};
use crate::meta::Fraction;
use crate::model::{apply_clean_aperture, parse_grid, parse_overlay};
use crate::{read_box_header, read_ftyp, BoxIter, Error};

#[test]
fn box_header_small_size() {
    let mut data = vec![];
    data.extend_from_slice(&12u32.to_be_bytes());
    data.extend_from_slice(b"ftyp");
    data.extend_from_slice(b"xx");
    let mut cursor = Cursor::new(data.as_slice());
    let header = read_box_header(&mut cursor).unwrap();
    assert_eq!(header.size, 12);
    assert_eq!(header.offset, 8);
    assert_eq!(header.name, BoxType::FileTypeBox);
}

#[test]
fn box_header_large_size() {
    let mut data = vec![];
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(b"mdat");
    data.extend_from_slice(&20u64.to_be_bytes());
    let mut cursor = Cursor::new(data.as_slice());
    let header = read_box_header(&mut cursor).unwrap();
    assert_eq!(header.size, 20);
    assert_eq!(header.offset, 16);
}

#[test]
fn box_header_rejects_zero_size() {
    let mut data = vec![];
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(b"mdat");
    let mut cursor = Cursor::new(data.as_slice());
    assert!(matches!(
        read_box_header(&mut cursor),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn box_header_rejects_undersized() {
    let mut data = vec![];
    data.extend_from_slice(&4u32.to_be_bytes());
    data.extend_from_slice(b"meta");
    let mut cursor = Cursor::new(data.as_slice());
    assert!(matches!(
        read_box_header(&mut cursor),
        Err(Error::InvalidData(_))
    ));
}

#[test]
fn ftyp_heic_brand_accepted() {
    let mut data = vec![];
    data.extend_from_slice(b"heic");
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(b"mif1");
    let size = 8u32 + data.len() as u32;
    let mut full = vec![];
    full.extend_from_slice(&size.to_be_bytes());
    full.extend_from_slice(b"ftyp");
    full.extend_from_slice(&data);

    let mut cursor = Cursor::new(full.as_slice());
    let mut iter = BoxIter::new(&mut cursor);
    let mut b = iter.next_box().unwrap().unwrap();
    let ftyp = read_ftyp(&mut b).unwrap();
    assert!(ftyp.is_heif_brand());
}

#[test]
fn ftyp_unrelated_brand_rejected_when_strict() {
    let mut data = vec![];
    data.extend_from_slice(b"isom");
    data.extend_from_slice(&0u32.to_be_bytes());
    let size = 8u32 + data.len() as u32;
    let mut full = vec![];
    full.extend_from_slice(&size.to_be_bytes());
    full.extend_from_slice(b"ftyp");
    full.extend_from_slice(&data);

    let mut cursor = Cursor::new(full.as_slice());
    let mut iter = BoxIter::new(&mut cursor);
    let mut b = iter.next_box().unwrap().unwrap();
    let ftyp = read_ftyp(&mut b).unwrap();
    assert!(!ftyp.is_heif_brand());
}

#[test]
fn fourcc_compares_against_byte_literal() {
    let fourcc = FourCC::from(u32::from_be_bytes(*b"hvc1"));
    assert!(fourcc == b"hvc1");
    assert!(fourcc != b"grid");
}

#[test]
fn fraction_round_half_away_from_zero() {
    let f = Fraction {
        numerator: 3,
        denominator: 2,
    };
    assert_eq!(f.round(), 2);
    let neg = Fraction {
        numerator: -3,
        denominator: 2,
    };
    assert_eq!(neg.round(), -2);
}

#[test]
fn fraction_add_and_sub() {
    let a = Fraction {
        numerator: 1,
        denominator: 2,
    };
    let b = Fraction {
        numerator: 1,
        denominator: 3,
    };
    let sum = a.add(b);
    assert_eq!(sum.round(), 1); // 5/6 rounds to 1
    let diff = a.sub(b);
    assert_eq!(diff.numerator * 6, diff.denominator); // 1/6
}

#[test]
fn grid_descriptor_small_fields() {
    let data = [0u8, 0, 1, 2, 0x01, 0x90, 0x00, 0xC8]; // 2 rows, 3 cols, 400x200
    let grid = parse_grid(&data).unwrap();
    assert_eq!(grid.rows, 2);
    assert_eq!(grid.columns, 3);
    assert_eq!(grid.output_width, 400);
    assert_eq!(grid.output_height, 200);
}

#[test]
fn grid_descriptor_large_fields() {
    let mut data = vec![0u8, 1, 0, 1]; // flags bit 0 set -> 32-bit fields
    data.extend_from_slice(&800u32.to_be_bytes());
    data.extend_from_slice(&600u32.to_be_bytes());
    let grid = parse_grid(&data).unwrap();
    assert_eq!(grid.rows, 1);
    assert_eq!(grid.columns, 2);
    assert_eq!(grid.output_width, 800);
    assert_eq!(grid.output_height, 600);
}

#[test]
fn overlay_descriptor_signed_offsets() {
    let mut data = vec![0u8, 0]; // version 0, flags 0 -> 2-byte fields
    for _ in 0..4 {
        data.extend_from_slice(&0u16.to_be_bytes()); // background color
    }
    data.extend_from_slice(&100u16.to_be_bytes()); // output_width
    data.extend_from_slice(&100u16.to_be_bytes()); // output_height
    data.extend_from_slice(&0u16.to_be_bytes()); // image 0: x = 0
    data.extend_from_slice(&0u16.to_be_bytes()); // image 0: y = 0
    data.extend_from_slice(&(-10i16).to_be_bytes()); // image 1: x = -10
    data.extend_from_slice(&(-5i16).to_be_bytes()); // image 1: y = -5

    let overlay = parse_overlay(&data, 2).unwrap();
    assert_eq!(overlay.output_width, 100);
    assert_eq!(overlay.offsets[0], (0, 0));
    assert_eq!(overlay.offsets[1], (-10, -5));
}

#[test]
fn overlay_descriptor_rejects_unsupported_version() {
    let data = [1u8, 0];
    assert!(parse_overlay(&data, 0).is_err());
}

#[test]
fn clean_aperture_centers_on_full_image() {
    let zero = Fraction {
        numerator: 0,
        denominator: 1,
    };
    let width = Fraction {
        numerator: 90,
        denominator: 1,
    };
    let height = Fraction {
        numerator: 50,
        denominator: 1,
    };
    let rect = apply_clean_aperture(100, 100, width, height, zero, zero).unwrap();
    assert_eq!(rect.width, 90);
    assert_eq!(rect.height, 50);
    // A centered crop on a 100x100 image is offset by 5 in each axis.
    assert_eq!(rect.horiz_off, 5);
    assert_eq!(rect.vert_off, 25);
}

#[test]
fn clean_aperture_rejects_non_positive_size() {
    let zero = Fraction {
        numerator: 0,
        denominator: 1,
    };
    let neg_width = Fraction {
        numerator: -1,
        denominator: 1,
    };
    assert!(apply_clean_aperture(100, 100, neg_width, zero, zero, zero).is_err());
}
