// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests against hand-built HEIF byte streams. There are no
//! binary fixtures checked into this crate, so every test constructs its
//! own minimal, valid (or deliberately broken) container in memory.

use heif_parse::{HeifSession, ImagePayload};

fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

fn make_fullbox(fourcc: &[u8; 4], version: u8, flags: u32, rest: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + rest.len());
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(rest);
    make_box(fourcc, &body)
}

fn ftyp_box() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"heic");
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(b"heic");
    body.extend_from_slice(b"mif1");
    make_box(b"ftyp", &body)
}

fn hdlr_box() -> Vec<u8> {
    let mut rest = Vec::new();
    rest.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
    rest.extend_from_slice(b"pict");
    rest.extend_from_slice(&[0u8; 12]); // reserved
    rest.push(0); // name (empty C-string)
    make_fullbox(b"hdlr", 0, 0, &rest)
}

fn pitm_box(item_id: u16) -> Vec<u8> {
    make_fullbox(b"pitm", 0, 0, &item_id.to_be_bytes())
}

fn infe_box(item_id: u16, item_type: &[u8; 4]) -> Vec<u8> {
    let mut rest = Vec::new();
    rest.extend_from_slice(&item_id.to_be_bytes());
    rest.extend_from_slice(&0u16.to_be_bytes()); // item_protection_index
    rest.extend_from_slice(item_type);
    rest.push(0); // item_name terminator
    make_fullbox(b"infe", 2, 0, &rest)
}

fn iinf_box(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut rest = Vec::new();
    rest.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for e in entries {
        rest.extend_from_slice(e);
    }
    make_fullbox(b"iinf", 0, 0, &rest)
}

fn ispe_box(width: u32, height: u32) -> Vec<u8> {
    let mut rest = Vec::new();
    rest.extend_from_slice(&width.to_be_bytes());
    rest.extend_from_slice(&height.to_be_bytes());
    make_fullbox(b"ispe", 0, 0, &rest)
}

fn hvcc_box(nalu: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; 21];
    body.push(0x03); // length_size_minus_one = 3 -> 4-byte NAL lengths
    body.push(1); // num_arrays
    body.push(0x21); // nal_unit_type, masked to 6 bits by the reader
    body.extend_from_slice(&1u16.to_be_bytes()); // num_nalus
    body.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
    body.extend_from_slice(nalu);
    make_box(b"hvcC", &body)
}

fn ipco_box(children: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for c in children {
        body.extend_from_slice(c);
    }
    make_box(b"ipco", &body)
}

fn ipma_box(item_id: u16, props: &[(u8, bool)]) -> Vec<u8> {
    let mut rest = Vec::new();
    rest.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    rest.extend_from_slice(&item_id.to_be_bytes());
    rest.push(props.len() as u8);
    for (index, essential) in props {
        rest.push((*index & 0x7f) | if *essential { 0x80 } else { 0 });
    }
    make_fullbox(b"ipma", 0, 0, &rest)
}

fn iprp_box(ipco: Vec<u8>, ipma: Vec<u8>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&ipco);
    body.extend_from_slice(&ipma);
    make_box(b"iprp", &body)
}

fn iloc_box(item_id: u16, offset: u32, length: u32) -> Vec<u8> {
    let mut rest = Vec::new();
    rest.push(0x44); // offset_size=4, length_size=4
    rest.push(0x00); // base_offset_size=0, reserved=0 (version 0 has no index_size)
    rest.extend_from_slice(&1u16.to_be_bytes()); // item_count
    rest.extend_from_slice(&item_id.to_be_bytes());
    rest.extend_from_slice(&0u16.to_be_bytes()); // data_reference_index
    rest.extend_from_slice(&1u16.to_be_bytes()); // extent_count
    rest.extend_from_slice(&offset.to_be_bytes());
    rest.extend_from_slice(&length.to_be_bytes());
    make_fullbox(b"iloc", 0, 0, &rest)
}

fn auxc_box(urn: &[u8]) -> Vec<u8> {
    let mut rest = Vec::with_capacity(urn.len() + 1);
    rest.extend_from_slice(urn);
    rest.push(0);
    make_fullbox(b"auxC", 0, 0, &rest)
}

fn iloc_multi_box(entries: &[(u16, u32, u32)]) -> Vec<u8> {
    let mut rest = Vec::new();
    rest.push(0x44); // offset_size=4, length_size=4
    rest.push(0x00); // base_offset_size=0, reserved=0
    rest.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for (item_id, offset, length) in entries {
        rest.extend_from_slice(&item_id.to_be_bytes());
        rest.extend_from_slice(&0u16.to_be_bytes()); // data_reference_index
        rest.extend_from_slice(&1u16.to_be_bytes()); // extent_count
        rest.extend_from_slice(&offset.to_be_bytes());
        rest.extend_from_slice(&length.to_be_bytes());
    }
    make_fullbox(b"iloc", 0, 0, &rest)
}

fn ipma_multi_box(entries: &[(u16, &[(u8, bool)])]) -> Vec<u8> {
    let mut rest = Vec::new();
    rest.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (item_id, props) in entries {
        rest.extend_from_slice(&item_id.to_be_bytes());
        rest.push(props.len() as u8);
        for (index, essential) in *props {
            rest.push((*index & 0x7f) | if *essential { 0x80 } else { 0 });
        }
    }
    make_fullbox(b"ipma", 0, 0, &rest)
}

fn iref_entry_box(ref_type: &[u8; 4], from_item_id: u16, to_item_ids: &[u16]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&from_item_id.to_be_bytes());
    body.extend_from_slice(&(to_item_ids.len() as u16).to_be_bytes());
    for id in to_item_ids {
        body.extend_from_slice(&id.to_be_bytes());
    }
    make_box(ref_type, &body)
}

fn iref_box(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut rest = Vec::new();
    for e in entries {
        rest.extend_from_slice(e);
    }
    make_fullbox(b"iref", 0, 0, &rest)
}

fn meta_box(iloc_offset: u32, mdat_len: u32) -> Vec<u8> {
    let infe = infe_box(1, b"hvc1");
    let iinf = iinf_box(&[infe]);
    let hdlr = hdlr_box();
    let pitm = pitm_box(1);
    let ispe = ispe_box(64, 48);
    let hvcc = hvcc_box(&[0x42, 0x01, 0x02, 0x03]);
    let ipco = ipco_box(&[ispe, hvcc]);
    let ipma = ipma_box(1, &[(1, true), (2, true)]);
    let iprp = iprp_box(ipco, ipma);
    let iloc = iloc_box(1, iloc_offset, mdat_len);

    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iloc);
    make_fullbox(b"meta", 0, 0, &rest)
}

/// Build a minimal single-image HEIC file: one `hvc1` item, with one
/// length-prefixed "NAL" (`nalu_payload`) as its sample data in `mdat`.
fn build_minimal_heif(nalu_payload: &[u8]) -> Vec<u8> {
    let mut mdat_data = Vec::new();
    mdat_data.extend_from_slice(&(nalu_payload.len() as u32).to_be_bytes());
    mdat_data.extend_from_slice(nalu_payload);

    let ftyp = ftyp_box();
    // The iloc offset value doesn't affect any box's length, so a
    // placeholder pass is enough to learn where 'mdat' data will land.
    let meta_placeholder = meta_box(0, mdat_data.len() as u32);
    let prefix_len = ftyp.len() + meta_placeholder.len() + 8; // + mdat header
    let meta = meta_box(prefix_len as u32, mdat_data.len() as u32);
    assert_eq!(meta.len(), meta_placeholder.len());
    let mdat = make_box(b"mdat", &mdat_data);

    let mut out = Vec::new();
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&meta);
    out.extend_from_slice(&mdat);
    out
}

#[test]
fn minimal_heic_round_trip() {
    let file = build_minimal_heif(b"AAAAA");
    let mut session = HeifSession::read_memory(&file).expect("parse should succeed");

    assert_eq!(session.image_count(), 1);
    assert_eq!(session.primary_image_index().unwrap(), 0);

    let bundle = session.image_data(0).expect("extraction should succeed");
    assert_eq!(bundle.width, 64);
    assert_eq!(bundle.height, 48);
    assert!(bundle.alpha.is_none());
    assert!(bundle.depth.is_none());

    match bundle.payload {
        ImagePayload::Single(bytes) => {
            // Parameter-set NAL (from hvcC) then the sample NAL, each with
            // its own Annex-B start code.
            assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
            let start_codes = bytes.windows(4).filter(|w| *w == [0, 0, 0, 1]).count();
            assert_eq!(start_codes, 2);
            assert!(bytes.windows(5).any(|w| w == b"AAAAA"));
        }
        other => panic!("expected a single hvc1 payload, got {other:?}"),
    }
}

#[test]
fn truncated_input_is_rejected() {
    let file = build_minimal_heif(b"AAAAA");
    let truncated = &file[..file.len() - 20];
    assert!(HeifSession::read_memory(truncated).is_err());
}

#[test]
fn non_heif_brand_rejected_by_default() {
    let mut file = build_minimal_heif(b"AAAAA");
    // Blank out every brand mention in 'ftyp' (major + both compatible
    // brands) so strict brand checking has nothing to accept.
    file[8..12].copy_from_slice(b"isom");
    file[16..20].copy_from_slice(b"isom");
    file[20..24].copy_from_slice(b"isom");
    assert!(HeifSession::read_memory(&file).is_err());
}

#[test]
fn image_index_out_of_range_is_an_error() {
    let file = build_minimal_heif(b"AAAAA");
    let mut session = HeifSession::read_memory(&file).unwrap();
    assert!(session.image_data(1).is_err());
}

/// A `thmb` item reference makes the smaller image a thumbnail of the
/// larger one; the thumbnail item itself must drop out of
/// `top_level_items`/`image_count`.
#[test]
fn thumbnail_item_is_not_top_level() {
    let full = infe_box(1, b"hvc1");
    let thumb = infe_box(2, b"hvc1");
    let iinf = iinf_box(&[full, thumb]);
    let hdlr = hdlr_box();
    let pitm = pitm_box(1);

    let ispe_full = ispe_box(64, 48);
    let ispe_thumb = ispe_box(16, 12);
    let hvcc = hvcc_box(&[0x42, 0x01, 0x02, 0x03]);
    let ipco = ipco_box(&[ispe_full, ispe_thumb, hvcc]);
    let ipma = ipma_multi_box(&[(1, &[(1, false), (3, false)]), (2, &[(2, false), (3, false)])]);
    let iprp = iprp_box(ipco, ipma);

    let iref = iref_box(&[iref_entry_box(b"thmb", 2, &[1])]);

    let full_nal = b"FULLFULL";
    let thumb_nal = b"THUMB";
    let mut mdat_data = Vec::new();
    mdat_data.extend_from_slice(&(full_nal.len() as u32).to_be_bytes());
    mdat_data.extend_from_slice(full_nal);
    let thumb_offset_in_mdat = mdat_data.len() as u32;
    mdat_data.extend_from_slice(&(thumb_nal.len() as u32).to_be_bytes());
    mdat_data.extend_from_slice(thumb_nal);

    let ftyp = ftyp_box();
    let iloc_placeholder = iloc_multi_box(&[(1, 0, 0), (2, 0, 0)]);
    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iref);
    rest.extend_from_slice(&iloc_placeholder);
    let meta_placeholder = make_fullbox(b"meta", 0, 0, &rest);

    let prefix_len = ftyp.len() + meta_placeholder.len() + 8;
    let full_offset = prefix_len as u32;
    let thumb_offset = prefix_len as u32 + thumb_offset_in_mdat;
    let full_len = 4 + full_nal.len() as u32;
    let thumb_len = 4 + thumb_nal.len() as u32;

    let iloc = iloc_multi_box(&[
        (1, full_offset, full_len),
        (2, thumb_offset, thumb_len),
    ]);
    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iref);
    rest.extend_from_slice(&iloc);
    let meta = make_fullbox(b"meta", 0, 0, &rest);
    assert_eq!(meta.len(), meta_placeholder.len());

    let mdat = make_box(b"mdat", &mdat_data);

    let mut file = Vec::new();
    file.extend_from_slice(&ftyp);
    file.extend_from_slice(&meta);
    file.extend_from_slice(&mdat);

    let mut session = HeifSession::read_memory(&file).expect("parse should succeed");
    assert_eq!(session.image_count(), 1);
    let bundle = session.image_data(0).expect("extraction should succeed");
    assert_eq!(bundle.item_id, 1);
    match bundle.payload {
        ImagePayload::Single(bytes) => {
            assert!(bytes.windows(8).any(|w| w == b"FULLFULL"));
        }
        other => panic!("expected a single hvc1 payload, got {other:?}"),
    }
}

/// A `grid` item made of two `hvc1` tiles, joined by `dimg` references.
#[test]
fn grid_item_assembles_its_tiles() {
    let grid_info = infe_box(1, b"grid");
    let tile1_info = infe_box(2, b"hvc1");
    let tile2_info = infe_box(3, b"hvc1");
    let iinf = iinf_box(&[grid_info, tile1_info, tile2_info]);
    let hdlr = hdlr_box();
    let pitm = pitm_box(1);

    let ispe_canvas = ispe_box(128, 48);
    let ispe_tile = ispe_box(64, 48);
    let hvcc = hvcc_box(&[0x42, 0x01, 0x02, 0x03]);
    let ipco = ipco_box(&[ispe_canvas, ispe_tile, hvcc]);
    let ipma = ipma_multi_box(&[
        (1, &[(1, false)]),
        (2, &[(2, false), (3, false)]),
        (3, &[(2, false), (3, false)]),
    ]);
    let iprp = iprp_box(ipco, ipma);

    let iref = iref_box(&[iref_entry_box(b"dimg", 1, &[2, 3])]);

    // version=0, flags=0, rows-1=0 (1 row), columns-1=1 (2 columns),
    // output_width/height as u16 fields (flags bit 0 clear).
    let grid_desc: Vec<u8> = vec![0, 0, 0, 1, 0, 128, 0, 48];

    let tile1_nal = b"TILE1AAA";
    let tile2_nal = b"TILE2BBB";
    let mut tile1_mdat = Vec::new();
    tile1_mdat.extend_from_slice(&(tile1_nal.len() as u32).to_be_bytes());
    tile1_mdat.extend_from_slice(tile1_nal);
    let mut tile2_mdat = Vec::new();
    tile2_mdat.extend_from_slice(&(tile2_nal.len() as u32).to_be_bytes());
    tile2_mdat.extend_from_slice(tile2_nal);

    let mut mdat_data = Vec::new();
    mdat_data.extend_from_slice(&grid_desc);
    let tile1_offset_in_mdat = mdat_data.len() as u32;
    mdat_data.extend_from_slice(&tile1_mdat);
    let tile2_offset_in_mdat = mdat_data.len() as u32;
    mdat_data.extend_from_slice(&tile2_mdat);

    let ftyp = ftyp_box();
    let iloc_placeholder = iloc_multi_box(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iref);
    rest.extend_from_slice(&iloc_placeholder);
    let meta_placeholder = make_fullbox(b"meta", 0, 0, &rest);

    let prefix_len = ftyp.len() + meta_placeholder.len() + 8;
    let grid_offset = prefix_len as u32;
    let tile1_offset = prefix_len as u32 + tile1_offset_in_mdat;
    let tile2_offset = prefix_len as u32 + tile2_offset_in_mdat;

    let iloc = iloc_multi_box(&[
        (1, grid_offset, grid_desc.len() as u32),
        (2, tile1_offset, tile1_mdat.len() as u32),
        (3, tile2_offset, tile2_mdat.len() as u32),
    ]);
    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iref);
    rest.extend_from_slice(&iloc);
    let meta = make_fullbox(b"meta", 0, 0, &rest);
    assert_eq!(meta.len(), meta_placeholder.len());

    let mdat = make_box(b"mdat", &mdat_data);

    let mut file = Vec::new();
    file.extend_from_slice(&ftyp);
    file.extend_from_slice(&meta);
    file.extend_from_slice(&mdat);

    let mut session = HeifSession::read_memory(&file).expect("parse should succeed");
    assert_eq!(session.image_count(), 1);
    let bundle = session.image_data(0).expect("extraction should succeed");
    match bundle.payload {
        ImagePayload::Grid { descriptor, tiles } => {
            assert_eq!(descriptor.rows, 1);
            assert_eq!(descriptor.columns, 2);
            assert_eq!(descriptor.output_width, 128);
            assert_eq!(descriptor.output_height, 48);
            assert_eq!(tiles.len(), 2);
            assert!(tiles[0].windows(8).any(|w| w == b"TILE1AAA"));
            assert!(tiles[1].windows(8).any(|w| w == b"TILE2BBB"));
        }
        other => panic!("expected a grid payload, got {other:?}"),
    }
}

/// An `ipma` association that points past the end of `ipco` must be
/// rejected rather than silently skipped.
#[test]
fn ipma_with_out_of_range_property_index_is_rejected() {
    let infe = infe_box(1, b"hvc1");
    let iinf = iinf_box(&[infe]);
    let hdlr = hdlr_box();
    let pitm = pitm_box(1);
    let ispe = ispe_box(64, 48);
    let hvcc = hvcc_box(&[0x42, 0x01, 0x02, 0x03]);
    // Only two properties are defined (indices 1 and 2), but the
    // association below references index 5.
    let ipco = ipco_box(&[ispe, hvcc]);
    let ipma = ipma_box(1, &[(5, false)]);
    let iprp = iprp_box(ipco, ipma);
    let iloc = iloc_box(1, 0, 8);

    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iloc);
    let meta = make_fullbox(b"meta", 0, 0, &rest);

    let ftyp = ftyp_box();
    let mdat = make_box(b"mdat", &[0u8; 8]);

    let mut file = Vec::new();
    file.extend_from_slice(&ftyp);
    file.extend_from_slice(&meta);
    file.extend_from_slice(&mdat);

    let err = HeifSession::read_memory(&file).unwrap_err();
    assert_eq!(err.code(), "Invalid_input");
    assert_eq!(err.subcode(), "Ipma_box_references_nonexisting_property");
}

/// An `auxl` reference to an `auxC`-tagged alpha item surfaces the alpha
/// plane on the parent image's bundle.
#[test]
fn alpha_auxiliary_image_is_attached() {
    let color_info = infe_box(1, b"hvc1");
    let alpha_info = infe_box(2, b"hvc1");
    let iinf = iinf_box(&[color_info, alpha_info]);
    let hdlr = hdlr_box();
    let pitm = pitm_box(1);

    let ispe = ispe_box(64, 48);
    let hvcc = hvcc_box(&[0x42, 0x01, 0x02, 0x03]);
    let auxc = auxc_box(b"urn:mpeg:hevc:2015:auxid:1");
    let ipco = ipco_box(&[ispe, hvcc, auxc]);
    let ipma = ipma_multi_box(&[
        (1, &[(1, false), (2, false)]),
        (2, &[(1, false), (2, false), (3, false)]),
    ]);
    let iprp = iprp_box(ipco, ipma);

    let iref = iref_box(&[iref_entry_box(b"auxl", 2, &[1])]);

    let color_nal = b"COLORAAA";
    let alpha_nal = b"ALPHABBB";
    let mut mdat_data = Vec::new();
    mdat_data.extend_from_slice(&(color_nal.len() as u32).to_be_bytes());
    mdat_data.extend_from_slice(color_nal);
    let alpha_offset_in_mdat = mdat_data.len() as u32;
    mdat_data.extend_from_slice(&(alpha_nal.len() as u32).to_be_bytes());
    mdat_data.extend_from_slice(alpha_nal);

    let ftyp = ftyp_box();
    let iloc_placeholder = iloc_multi_box(&[(1, 0, 0), (2, 0, 0)]);
    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iref);
    rest.extend_from_slice(&iloc_placeholder);
    let meta_placeholder = make_fullbox(b"meta", 0, 0, &rest);

    let prefix_len = ftyp.len() + meta_placeholder.len() + 8;
    let color_offset = prefix_len as u32;
    let alpha_offset = prefix_len as u32 + alpha_offset_in_mdat;
    let color_len = 4 + color_nal.len() as u32;
    let alpha_len = 4 + alpha_nal.len() as u32;

    let iloc = iloc_multi_box(&[
        (1, color_offset, color_len),
        (2, alpha_offset, alpha_len),
    ]);
    let mut rest = Vec::new();
    rest.extend_from_slice(&hdlr);
    rest.extend_from_slice(&pitm);
    rest.extend_from_slice(&iinf);
    rest.extend_from_slice(&iprp);
    rest.extend_from_slice(&iref);
    rest.extend_from_slice(&iloc);
    let meta = make_fullbox(b"meta", 0, 0, &rest);
    assert_eq!(meta.len(), meta_placeholder.len());

    let mdat = make_box(b"mdat", &mdat_data);

    let mut file = Vec::new();
    file.extend_from_slice(&ftyp);
    file.extend_from_slice(&meta);
    file.extend_from_slice(&mdat);

    let mut session = HeifSession::read_memory(&file).expect("parse should succeed");
    assert_eq!(session.image_count(), 1);
    let bundle = session.image_data(0).expect("extraction should succeed");
    let alpha = bundle.alpha.expect("alpha plane should be attached");
    assert!(alpha.windows(8).any(|w| w == b"ALPHABBB"));
}
