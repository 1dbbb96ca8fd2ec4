//! Parser for HEIF/HEIC (ISO/IEC 23008-12) image containers.
//!
//! This crate reads the ISOBMFF box tree, interprets the `meta` item and
//! property model, and extracts ready-to-decode HEVC elementary streams
//! (or grid/overlay tile lists) for the images it describes. It does not
//! decode HEVC, render, or write/mux HEIF files.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[macro_use]
extern crate log;

use byteorder::ReadBytesExt;
use fallible_collections::TryRead;
use std::convert::TryInto as _;
use std::fs::File;
use std::io::{Read, Take};
use std::path::Path;

#[macro_use]
mod macros;

mod boxes;
mod extractor;
mod meta;
mod model;
mod sei;

#[cfg(test)]
mod tests;

use boxes::{BoxType, FourCC};
use meta::{ExtentRange, HeifMeta};
use model::{CleanApertureRect, GridDescriptor, HeifImage, OverlayDescriptor};
pub use sei::DepthRepresentationInfo;

/// Per ISO/IEC 14496-12 § 19.9: a box tree may nest at most this deep
/// before we assume the input is pathological rather than merely unusual.
const MAX_CHILDREN_PER_BOX: usize = 1024;
/// Upper bound on the number of items an `iloc` box (or the item graph
/// built from it) may describe.
const MAX_ILOC_ITEMS: usize = 1024;
/// Upper bound on the number of extents a single item may be split across.
const MAX_EXTENTS_PER_ITEM: usize = 32;
/// Upper bound on a single buffered memory block (one `mdat`, one `idat`,
/// or one extracted item's bytes), to bound worst-case memory use for a
/// crafted `size` field.
const MAX_MEMORY_BLOCK_SIZE: u64 = 50 * 1024 * 1024;

/// A trait to indicate a type can be infallibly converted to `u64`.
trait ToU64 {
    fn to_u64(self) -> u64;
}

impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        static_assertions::const_assert!(
            std::mem::size_of::<usize>() <= std::mem::size_of::<u64>()
        );
        self.try_into().expect("usize -> u64 conversion failed")
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                static_assertions::const_assert!(
                    std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>()
                );
                self.try_into().expect(concat!(
                    stringify!($from_type),
                    " -> usize conversion failed"
                ))
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

/// Indicate the current offset (i.e., bytes already read) in a reader.
trait Offset {
    fn offset(&self) -> u64;
}

/// Wraps a reader to track the current offset.
struct OffsetReader<'a, T> {
    reader: &'a mut T,
    offset: u64,
}

impl<'a, T> OffsetReader<'a, T> {
    fn new(reader: &'a mut T) -> Self {
        Self { reader, offset: 0 }
    }
}

impl<'a, T> Offset for OffsetReader<'a, T> {
    fn offset(&self) -> u64 {
        self.offset
    }
}

impl<'a, T: Read> Read for OffsetReader<'a, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.offset = self
            .offset
            .checked_add(bytes_read.to_u64())
            .expect("total bytes read too large for offset type");
        Ok(bytes_read)
    }
}

pub type TryVec<T> = fallible_collections::TryVec<T>;
pub type TryString = fallible_collections::TryVec<u8>;
pub type TryHashMap<K, V> = fallible_collections::TryHashMap<K, V>;
pub type TryBox<T> = fallible_collections::TryBox<T>;

// To ensure we don't use stdlib allocating types by accident.
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser failures as a `(code, subcode)` pair a host application
/// can match on, independent of `Debug`/`Display` message text.
///
/// `code()` returns the broad category; `subcode()` returns the specific,
/// stable identifier within it (e.g. `"Ipma_box_references_nonexisting_property"`).
#[derive(Debug)]
pub enum Error {
    /// `Invalid_input`: malformed or structurally invalid data. The payload
    /// is the subcode, e.g. `"No_ftyp_box"`, `"Invalid_box_size"`.
    InvalidData(&'static str),
    /// `Unsupported_filetype` / `Unsupported_feature`: recognized but
    /// unsupported input (e.g. `"Unsupported_codec"`).
    Unsupported(&'static str),
    /// `Usage_error`: caller misuse of the public API (e.g. an out-of-range
    /// image index).
    UsageError(&'static str),
    /// `Input_does_not_exist`: the file could not be opened.
    InputDoesNotExist,
    /// `Invalid_input:End_of_data`: reflects
    /// `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io` not covered above.
    Io(std::io::Error),
    /// `Memory_allocation_error:Security_limit_exceeded`: out of memory, or
    /// a size/count exceeded one of the fixed security limits
    /// (`MAX_CHILDREN_PER_BOX`, `MAX_ILOC_ITEMS`, `MAX_EXTENTS_PER_ITEM`,
    /// `MAX_MEMORY_BLOCK_SIZE`).
    OutOfMemory,
}

impl Error {
    /// The broad error category, matching a `code` from spec § 7.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidData(_) | Error::UnexpectedEOF | Error::Io(_) => "Invalid_input",
            Error::Unsupported(_) => "Unsupported_feature",
            Error::UsageError(_) => "Usage_error",
            Error::InputDoesNotExist => "Input_does_not_exist",
            Error::OutOfMemory => "Memory_allocation_error",
        }
    }

    /// The specific, stable subcode identifier within `code()`.
    pub fn subcode(&self) -> &'static str {
        match self {
            Error::InvalidData(s) | Error::Unsupported(s) | Error::UsageError(s) => s,
            Error::InputDoesNotExist => "File_open_failed",
            Error::UnexpectedEOF => "End_of_data",
            Error::Io(_) => "Io_error",
            Error::OutOfMemory => "Security_limit_exceeded",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    fn from(_: bitreader::BitReaderError) -> Error {
        Error::InvalidData("invalid data")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::UnexpectedEOF,
            _ => Error::Io(err),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Error {
        Error::InvalidData("invalid utf8")
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Error {
        Error::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<fallible_collections::TryReserveError> for Error {
    fn from(_: fallible_collections::TryReserveError) -> Error {
        Error::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Options controlling parse strictness and resource usage. There is no
/// mutable global state; any configuration is explicit and per-session.
#[derive(Debug, Clone, Copy)]
pub struct ParseConfig {
    /// Require the `ftyp` major or compatible brand to include `heic`,
    /// `heix`, or `mif1`. When false, any `ftyp` is accepted as long as a
    /// `meta` box with a valid item model follows.
    pub strict_brand_check: bool,
    /// Reserved for hosts that want to assert a session is only ever
    /// touched from one thread; this parser never spawns threads or
    /// shares state regardless of this flag.
    pub thread_safe_reads: bool,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            strict_brand_check: true,
            thread_safe_reads: false,
        }
    }
}

/// Basic ISO box structure.
///
/// HEIF files are a sequence of possibly-nested 'box' structures. Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box.
///
/// See ISO/IEC 14496-12 § 4.2.
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    name: BoxType,
    size: u64,
    offset: u64,
    uuid: Option<[u8; 16]>,
    /// `size == 0` in the wire encoding: this box's content runs to the end
    /// of the enclosing container rather than a declared length.
    open_ended: bool,
}

impl BoxHeader {
    const MIN_SIZE: u64 = 8;
    const MIN_LARGE_SIZE: u64 = 16;
}

/// File type box `ftyp`.
#[derive(Debug)]
struct FileTypeBox {
    major_brand: FourCC,
    #[allow(dead_code)]
    minor_version: u32,
    compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    fn is_heif_brand(&self) -> bool {
        let is_heif = |b: &FourCC| *b == b"heic" || *b == b"heix" || *b == b"mif1";
        is_heif(&self.major_brand) || self.compatible_brands.iter().any(is_heif)
    }
}

/// A Media Data Box.
/// See ISO/IEC 14496-12 § 8.1.1.
///
/// Buffered whole, so that every item's `iloc` extents (not just the
/// primary item's) can be resolved without re-seeking the input stream.
pub(crate) struct MediaDataBox {
    /// Offset of `data` from the beginning of the file.
    offset: u64,
    pub(crate) data: TryVec<u8>,
}

impl MediaDataBox {
    /// Check whether the beginning of `extent` is within the bounds of
    /// this `MediaDataBox`. Extents are assumed not to cross box
    /// boundaries; if one does, `read_extent` will report an error.
    pub(crate) fn contains_extent(&self, extent: &ExtentRange) -> bool {
        if self.offset <= extent.start() {
            let start_offset = extent.start() - self.offset;
            start_offset < self.data.len().to_u64()
        } else {
            false
        }
    }

    /// Check whether `extent` covers this `MediaDataBox` exactly.
    pub(crate) fn matches_extent(&self, extent: &ExtentRange) -> bool {
        if self.offset == extent.start() {
            match extent {
                ExtentRange::WithLength(range) => {
                    if let Some(end) = self.offset.checked_add(self.data.len().to_u64()) {
                        end == range.end
                    } else {
                        false
                    }
                }
                ExtentRange::ToEnd(_) => true,
            }
        } else {
            false
        }
    }

    /// Copy the range specified by `extent` to the end of `buf`, or
    /// return an error if the range is not fully contained within this box.
    pub(crate) fn read_extent(&mut self, extent: &ExtentRange, buf: &mut TryVec<u8>) -> Result<()> {
        let start_offset = extent
            .start()
            .checked_sub(self.offset)
            .expect("mdat does not contain extent");
        let slice = match extent {
            ExtentRange::WithLength(range) => {
                let range_len = range
                    .end
                    .checked_sub(range.start)
                    .expect("range start > end");
                let end = start_offset
                    .checked_add(range_len)
                    .expect("extent end overflow");
                self.data.get(start_offset.try_into()?..end.try_into()?)
            }
            ExtentRange::ToEnd(_) => self.data.get(start_offset.try_into()?..),
        };
        let slice = slice.ok_or(Error::InvalidData("extent crosses box boundary"))?;
        buf.extend_from_slice(slice)?;
        Ok(())
    }
}

/// See ISO/IEC 14496-12 § 4.2.
struct BMFFBox<'a, T> {
    head: BoxHeader,
    content: Take<&'a mut T>,
}

struct BoxIter<'a, T> {
    src: &'a mut T,
    children_seen: usize,
}

impl<'a, T: Read> BoxIter<'a, T> {
    fn new(src: &mut T) -> BoxIter<'_, T> {
        BoxIter {
            src,
            children_seen: 0,
        }
    }

    fn next_box(&mut self) -> Result<Option<BMFFBox<'_, T>>> {
        if self.children_seen >= MAX_CHILDREN_PER_BOX {
            return Err(Error::Unsupported("too many child boxes"));
        }
        let r = read_box_header(self.src);
        match r {
            Ok(h) => {
                self.children_seen += 1;
                Ok(Some(BMFFBox {
                    head: h,
                    content: self.src.take(h.size - h.offset),
                }))
            }
            Err(Error::UnexpectedEOF) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<'a, T: Read> Read for BMFFBox<'a, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<'a, T: Read> TryRead for BMFFBox<'a, T> {
    fn try_read_to_end(&mut self, buf: &mut TryVec<u8>) -> std::io::Result<usize> {
        // Capped below the declared remaining length: an open-ended box
        // (size == 0) reports an artificial, unbounded `bytes_left()`, so
        // the real limit has to come from here rather than from the box's
        // own accounting.
        let cap = self.bytes_left().min(MAX_MEMORY_BLOCK_SIZE + 1);
        fallible_collections::try_read_up_to(self, cap, buf)
    }
}

impl<'a, T: Offset> Offset for BMFFBox<'a, T> {
    fn offset(&self) -> u64 {
        self.content.get_ref().offset()
    }
}

impl<'a, T: Read> BMFFBox<'a, T> {
    fn bytes_left(&self) -> u64 {
        self.content.limit()
    }

    fn box_iter(&mut self) -> BoxIter<'_, BMFFBox<'a, T>> {
        BoxIter::new(self)
    }

    fn read_into_try_vec(&mut self) -> Result<TryVec<u8>> {
        let mut buf = TryVec::new();
        self.try_read_to_end(&mut buf)?;
        if buf.len().to_u64() > MAX_MEMORY_BLOCK_SIZE {
            return Err(Error::Unsupported("box content exceeds memory block limit"));
        }
        Ok(buf)
    }
}

impl<'a, T> Drop for BMFFBox<'a, T> {
    fn drop(&mut self) {
        if self.content.limit() > 0 {
            let name: FourCC = self.head.name.into();
            debug!("Dropping {} bytes in '{}'", self.content.limit(), name);
        }
    }
}

/// Read and parse a box header.
/// See ISO/IEC 14496-12 § 4.2.
fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    // size == 0 means "extends to the end of the enclosing container";
    // represented as an open Take bound rather than a declared length.
    let open_ended = size32 == 0;
    let size = match size32 {
        0 => u64::MAX,
        1 => {
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("Invalid_box_size"));
            }
            size64
        }
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("Invalid_box_size"));
            }
            u64::from(size32)
        }
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let uuid = if name == BoxType::UuidBox {
        if size >= offset + 16 {
            let mut buffer = [0u8; 16];
            let count = src.read(&mut buffer)?;
            offset += count.to_u64();
            if count == 16 {
                Some(buffer)
            } else {
                debug!("malformed uuid (short read), skipping");
                None
            }
        } else {
            debug!("malformed uuid, skipping");
            None
        }
    } else {
        None
    };
    assert!(offset <= size);
    Ok(BoxHeader {
        name,
        size,
        offset,
        uuid,
        open_ended,
    })
}

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

/// Parse the extra fields for a full box whose flag fields must be zero.
fn read_fullbox_version_no_flags<T: ReadBytesExt>(src: &mut T) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;
    if flags != 0 {
        return Err(Error::Unsupported("expected flags to be 0"));
    }
    Ok(version)
}

/// Skip over the entire contents of a box.
fn skip_box_content<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let to_skip = {
        let header = &src.head;
        debug!("{:?} (skipped)", header);
        header
            .size
            .checked_sub(header.offset)
            .expect("header offset > size")
    };
    assert_eq!(to_skip, src.bytes_left());
    skip(src, to_skip)
}

/// Skip over the remaining (unparsed tail of) data of a box.
fn skip_box_remain<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let remain = {
        let header = &src.head;
        let len = src.bytes_left();
        debug!("remain {} (skipped) in {:?}", len, header);
        len
    };
    skip(src, remain)
}

/// Parse an ftyp box.
/// See ISO/IEC 14496-12 § 4.3.
fn read_ftyp<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FileTypeBox> {
    let major = be_u32(src)?;
    let minor = be_u32(src)?;
    let bytes_left = src.bytes_left();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData("invalid ftyp size"));
    }
    let brand_count = bytes_left / 4;
    let mut brands = TryVec::with_capacity(brand_count.try_into()?)?;
    for _ in 0..brand_count {
        brands.push(be_u32(src)?.into())?;
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        minor_version: minor,
        compatible_brands: brands,
    })
}

/// Skip a number of bytes that we don't care to parse.
fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<()> {
    std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    Ok(())
}

fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

/// The decoded payload for one requested image, in the shape its item
/// type implies: a single elementary stream, or a grid/overlay of tiles.
#[derive(Debug)]
pub enum ImagePayload {
    /// A `hvc1` item: one ready-to-decode Annex-B HEVC elementary stream.
    Single(TryVec<u8>),
    /// A `grid` item: the grid layout plus each tile's elementary stream,
    /// in raster (row-major) order matching `dimg` references.
    Grid {
        descriptor: GridDescriptor,
        tiles: TryVec<TryVec<u8>>,
    },
    /// An `iovl` item: the overlay layout plus each referenced image's
    /// elementary stream, in the order the descriptor's offsets apply to.
    Overlay {
        descriptor: OverlayDescriptor,
        tiles: TryVec<TryVec<u8>>,
    },
}

/// Everything extracted for one requested image item.
#[derive(Debug)]
pub struct ImageBundle {
    pub item_id: u32,
    pub payload: ImagePayload,
    pub width: u32,
    pub height: u32,
    pub rotation_quarter_turns: u8,
    pub mirror_axis: Option<u8>,
    pub clean_aperture: Option<CleanApertureRect>,
    pub alpha: Option<TryVec<u8>>,
    pub premultiplied_alpha: bool,
    pub depth: Option<(TryVec<u8>, Option<DepthRepresentationInfo>)>,
    pub exif: Option<TryVec<u8>>,
}

/// A parsed HEIF container, ready for item extraction.
pub struct HeifSession {
    meta: HeifMeta,
    images: TryVec<HeifImage>,
    mdats: TryVec<MediaDataBox>,
    dump: TryString,
}

impl HeifSession {
    /// Parse a HEIF file from disk.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path).map_err(|_| Error::InputDoesNotExist)?;
        Self::parse(&mut file, ParseConfig::default())
    }

    /// Parse a HEIF file already held in memory.
    pub fn read_memory(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        Self::parse(&mut cursor, ParseConfig::default())
    }

    /// Parse with explicit configuration.
    pub fn read_memory_with_config(bytes: &[u8], config: ParseConfig) -> Result<Self> {
        let mut cursor = bytes;
        Self::parse(&mut cursor, config)
    }

    fn parse<T: Read>(f: &mut T, config: ParseConfig) -> Result<Self> {
        let mut f = OffsetReader::new(f);
        let mut iter = BoxIter::new(&mut f);
        let mut dump = TryString::new();

        // 'ftyp' box must occur first; see ISO/IEC 14496-12 § 4.3.1.
        let ftyp = match iter.next_box()? {
            Some(mut b) if b.head.name == BoxType::FileTypeBox => {
                let ftyp = read_ftyp(&mut b)?;
                append_dump_line(&mut dump, 0, "ftyp", b.head.size)?;
                if config.strict_brand_check && !ftyp.is_heif_brand() {
                    return Err(Error::InvalidData("No_ftyp_box"));
                }
                ftyp
            }
            Some(_) => return Err(Error::InvalidData("No_ftyp_box")),
            None => return Err(Error::InvalidData("No_ftyp_box")),
        };

        let mut meta = None;
        let mut mdats = TryVec::new();

        while let Some(mut b) = iter.next_box()? {
            let name_str = format!("{}", FourCC::from(b.head.name));
            append_dump_line(&mut dump, 0, &name_str, b.head.size)?;
            match b.head.name {
                BoxType::MetadataBox => {
                    if meta.is_some() {
                        return Err(Error::InvalidData(
                            "There should be zero or one meta boxes per ISO 14496-12 § 8.11.1.1",
                        ));
                    }
                    meta = Some(meta::read_heif_meta(&mut b)?);
                }
                BoxType::MediaDataBox => {
                    if b.bytes_left() > 0 {
                        let offset = b.offset();
                        let data = b.read_into_try_vec()?;
                        mdats.push(MediaDataBox { offset, data })?;
                    }
                }
                _ => skip_box_content(&mut b)?,
            }
            // An open-ended box (size == 0) has no declared length to
            // check consumption against; it runs to the end of its
            // container by definition, and is the last box there.
            if !b.head.open_ended {
                check_parser_state!(b.content);
            }
        }

        let _ = ftyp;
        let meta = meta.ok_or(Error::InvalidData("No_meta_box"))?;
        let images = model::interpret_items(&meta)?;

        Ok(HeifSession {
            meta,
            images,
            mdats,
            dump,
        })
    }

    /// Ids of items that stand on their own (not merely a thumbnail or
    /// auxiliary channel of another item), in the order they were
    /// registered.
    pub fn top_level_items(&self) -> TryVec<u32> {
        let mut ids = TryVec::new();
        for img in self.images.iter() {
            if img.is_top_level && !img.hidden {
                let _ = ids.push(img.item_id);
            }
        }
        ids
    }

    /// Index, within [`top_level_items`](Self::top_level_items), of the
    /// primary image.
    pub fn primary_image_index(&self) -> Result<usize> {
        let top_level = self.top_level_items();
        top_level
            .iter()
            .position(|&id| self.images.iter().any(|i| i.item_id == id && i.is_primary))
            .ok_or(Error::InvalidData("No_or_invalid_primary_image"))
    }

    /// Number of top-level images available via [`image_data`](Self::image_data).
    pub fn image_count(&self) -> usize {
        self.top_level_items().len()
    }

    /// Extract and assemble the bundle for the top-level image at `index`.
    pub fn image_data(&mut self, index: usize) -> Result<ImageBundle> {
        let top_level = self.top_level_items();
        let item_id = *top_level
            .get(index)
            .ok_or(Error::UsageError("Index_out_of_range"))?;
        self.bundle_for_item(item_id)
    }

    fn bundle_for_item(&mut self, item_id: u32) -> Result<ImageBundle> {
        let image = self
            .images
            .iter()
            .find(|i| i.item_id == item_id)
            .ok_or(Error::UsageError("Nonexisting_image_referenced"))?;
        let item_type = image.item_type;
        let width = image.width;
        let height = image.height;
        let rotation_quarter_turns = image.rotation_quarter_turns;
        let mirror_axis = image.mirror_axis;
        let clean_aperture = image.clean_aperture;
        let exif_item_id = image.exif_item_id;

        let alpha_item = self
            .images
            .iter()
            .find(|i| i.alpha_for == Some(item_id))
            .map(|i| (i.item_id, i.premultiplied_alpha));
        let depth_item = self
            .images
            .iter()
            .find(|i| i.depth_for == Some(item_id))
            .map(|i| i.item_id);

        let payload = if item_type == b"hvc1" {
            ImagePayload::Single(extractor::hevc_annex_b_bytes(
                item_id,
                &self.meta,
                &mut self.mdats,
            )?)
        } else if item_type == b"grid" {
            let raw = extractor::item_raw_bytes(item_id, &self.meta, &mut self.mdats)?;
            let tile_ids = self.dimg_targets(item_id);
            let descriptor = model::parse_grid(&raw)?;
            if tile_ids.len() != (descriptor.rows * descriptor.columns).to_usize() {
                return Err(Error::InvalidData("Missing_grid_images"));
            }
            let mut tiles = TryVec::with_capacity(tile_ids.len())?;
            for tile_id in tile_ids {
                tiles.push(extractor::hevc_annex_b_bytes(
                    tile_id,
                    &self.meta,
                    &mut self.mdats,
                )?)?;
            }
            ImagePayload::Grid { descriptor, tiles }
        } else if item_type == b"iovl" {
            let raw = extractor::item_raw_bytes(item_id, &self.meta, &mut self.mdats)?;
            let tile_ids = self.dimg_targets(item_id);
            let descriptor = model::parse_overlay(&raw, tile_ids.len())?;
            let mut tiles = TryVec::with_capacity(tile_ids.len())?;
            for tile_id in tile_ids {
                tiles.push(extractor::hevc_annex_b_bytes(
                    tile_id,
                    &self.meta,
                    &mut self.mdats,
                )?)?;
            }
            ImagePayload::Overlay { descriptor, tiles }
        } else {
            return Err(Error::Unsupported("Unsupported_image_type"));
        };

        let alpha = match alpha_item {
            Some((id, _)) => {
                Some(extractor::hevc_annex_b_bytes(id, &self.meta, &mut self.mdats)?)
            }
            None => None,
        };
        let premultiplied_alpha = alpha_item.map_or(false, |(_, prem)| prem);

        let depth = match depth_item {
            Some(id) => {
                let bytes = extractor::hevc_annex_b_bytes(id, &self.meta, &mut self.mdats)?;
                let info = sei::decode_depth_representation_info(&bytes)?;
                Some((bytes, info))
            }
            None => None,
        };

        let exif = match exif_item_id {
            Some(id) => {
                let raw = extractor::item_raw_bytes(id, &self.meta, &mut self.mdats)?;
                // Exif items are prefixed by a 4-byte exif_tiff_header_offset
                // field; see ISO/IEC 23008-12 Annex A.
                if raw.len() < 4 {
                    return Err(Error::InvalidData("Exif item too short"));
                }
                let mut payload = TryVec::with_capacity(raw.len() - 4)?;
                payload.extend_from_slice(&raw[4..])?;
                Some(payload)
            }
            None => None,
        };

        Ok(ImageBundle {
            item_id,
            payload,
            width,
            height,
            rotation_quarter_turns,
            mirror_axis,
            clean_aperture,
            alpha,
            premultiplied_alpha,
            depth,
            exif,
        })
    }

    /// Ids referenced by a `dimg` ("derived image") item reference from
    /// `from_item_id`, in the order they appear in the `iref` box.
    fn dimg_targets(&self, from_item_id: u32) -> TryVec<u32> {
        let mut ids = TryVec::new();
        for iref in self.meta.item_references.iter() {
            if iref.item_type == b"dimg" && iref.from_item_id == from_item_id {
                let _ = ids.push(iref.to_item_id);
            }
        }
        ids
    }

    /// A human-readable, indented listing of the top-level box tree seen
    /// during parsing, for debugging.
    pub fn debug_dump_boxes(&self) -> TryString {
        let mut out = TryString::new();
        let _ = out.extend_from_slice(&self.dump);
        out
    }
}

fn append_dump_line(dump: &mut TryString, depth: usize, name: &str, size: u64) -> Result<()> {
    for _ in 0..depth {
        dump.extend_from_slice(b"  ")?;
    }
    dump.extend_from_slice(name.as_bytes())?;
    dump.extend_from_slice(format!(" ({} bytes)\n", size).as_bytes())?;
    Ok(())
}
