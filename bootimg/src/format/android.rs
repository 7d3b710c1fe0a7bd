// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Seek, SeekFrom, Write},
    mem, str,
};

use bstr::ByteSlice;
use ring::digest::Context;
use thiserror::Error;
use zerocopy::{little_endian, FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryType},
    error::{Error as LibError, Result},
    format::{
        padding::{self, ZeroPadding},
        segment::{SegmentReader, SegmentReaderEntry, SegmentWriter, SegmentWriterEntry},
        Bid, FormatCode, FormatReader, FormatWriter,
    },
    header::{Header, HeaderFields},
    stream::{read_retry, ReadSeek, ReadWriteSeek},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;

/// The header magic must start strictly before this file offset.
pub const MAX_HEADER_OFFSET: usize = 512;

pub const SAMSUNG_SEANDROID_MAGIC: [u8; 16] = *b"SEANDROIDENFORCE";

pub const BUMP_MAGIC: [u8; 16] = [
    0x41, 0xa9, 0xe4, 0x67, 0x74, 0x4d, 0x1d, 0x1b, 0xa4, 0x29, 0xf2, 0xec, 0xea, 0x65, 0x52, 0x79,
];

pub(crate) const SUPPORTED_FIELDS: HeaderFields = HeaderFields::BOARD_NAME
    .union(HeaderFields::KERNEL_CMDLINE)
    .union(HeaderFields::PAGE_SIZE)
    .union(HeaderFields::KERNEL_ADDRESS)
    .union(HeaderFields::RAMDISK_ADDRESS)
    .union(HeaderFields::SECONDBOOT_ADDRESS)
    .union(HeaderFields::KERNEL_TAGS_ADDRESS);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Android magic not found in the first {MAX_HEADER_OFFSET} bytes")]
    HeaderNotFound,
    #[error("Android header at offset {0:#x} exceeds file size")]
    HeaderOutOfBounds(u64),
    #[error("Failed to set header fields")]
    HeaderSetFieldsFailed(#[source] crate::header::Error),
    #[error("SEAndroid magic not found after the last segment")]
    SamsungMagicNotFound,
    #[error("Bump magic not found after the last segment")]
    BumpMagicNotFound,
    #[error("Invalid page size: {0}")]
    InvalidPageSize(u32),
    #[error("{0:?} field is not UTF-8 encoded")]
    StringNotUtf8(&'static str),
    #[error("{0:?} field is too long")]
    StringTooLong(&'static str),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
}

/// Raw on-disk layout of the Android boot image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub(crate) struct RawHeader {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    pub magic: [u8; 8],
    pub kernel_size: little_endian::U32,
    pub kernel_addr: little_endian::U32,
    pub ramdisk_size: little_endian::U32,
    pub ramdisk_addr: little_endian::U32,
    pub second_size: little_endian::U32,
    pub second_addr: little_endian::U32,
    pub tags_addr: little_endian::U32,
    pub page_size: little_endian::U32,
    pub dt_size: little_endian::U32,
    pub unused: little_endian::U32,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    pub id: [little_endian::U32; 8],
}

/// File offsets of the payload sections, computed by cumulative page-aligned
/// addition starting after the header.
pub(crate) struct SectionOffsets {
    pub kernel: u64,
    pub ramdisk: u64,
    pub second: u64,
    pub dt: u64,
}

pub(crate) fn section_offsets(raw: &RawHeader, header_offset: u64) -> SectionOffsets {
    let psize = u64::from(raw.page_size.get());

    // pos cannot overflow: adding u32::MAX a few times can't overflow a u64.
    // File length overflow is checked separately.
    let mut pos = header_offset + mem::size_of::<RawHeader>() as u64;
    pos += padding::calc(pos, psize);

    let kernel = pos;
    pos += u64::from(raw.kernel_size.get());
    pos += padding::calc(pos, psize);

    let ramdisk = pos;
    pos += u64::from(raw.ramdisk_size.get());
    pos += padding::calc(pos, psize);

    let second = pos;
    pos += u64::from(raw.second_size.get());
    pos += padding::calc(pos, psize);

    SectionOffsets {
        kernel,
        ramdisk,
        second,
        dt: pos,
    }
}

/// Position immediately after the last declared segment, where
/// post-processing tools append their trailer magic. The header page never
/// exceeds the page size.
fn trailer_offset(raw: &RawHeader) -> u64 {
    let psize = u64::from(raw.page_size.get());

    let mut pos = psize;
    pos += u64::from(raw.kernel_size.get());
    pos += padding::calc(pos, psize);
    pos += u64::from(raw.ramdisk_size.get());
    pos += padding::calc(pos, psize);
    pos += u64::from(raw.second_size.get());
    pos += padding::calc(pos, psize);
    pos += u64::from(raw.dt_size.get());
    pos += padding::calc(pos, psize);

    pos
}

/// Locate and parse the Android header. The magic may start at any offset in
/// `0..max_header_offset`.
pub(crate) fn find_header(
    file: &mut dyn ReadSeek,
    max_header_offset: usize,
) -> Result<(RawHeader, u64)> {
    debug_assert!(max_header_offset <= MAX_HEADER_OFFSET);

    file.seek(SeekFrom::Start(0))?;

    let mut buf = vec![0u8; max_header_offset + mem::size_of::<RawHeader>()];
    let n = read_retry(&mut *file, &mut buf)?;
    let buf = &buf[..n];

    // A magic that starts at or past the limit does not count, even when the
    // tail of the buffer happens to contain one.
    let window_len = buf.len().min(max_header_offset - 1 + BOOT_MAGIC.len());
    let offset = buf[..window_len]
        .find(BOOT_MAGIC)
        .ok_or(Error::HeaderNotFound)?;

    let (raw, _) = RawHeader::read_from_prefix(&buf[offset..])
        .map_err(|_| Error::HeaderOutOfBounds(offset as u64))?;

    Ok((raw, offset as u64))
}

/// Check that the trailer position holds the given 16-byte magic.
fn find_trailer_magic(
    file: &mut dyn ReadSeek,
    raw: &RawHeader,
    magic: &[u8; 16],
) -> Result<Option<u64>> {
    if raw.page_size.get() == 0 {
        return Ok(None);
    }

    let pos = trailer_offset(raw);
    file.seek(SeekFrom::Start(pos))?;

    let mut buf = [0u8; 16];
    let n = read_retry(&mut *file, &mut buf)?;

    if n == buf.len() && buf == *magic {
        Ok(Some(pos))
    } else {
        Ok(None)
    }
}

fn find_samsung_seandroid_magic(file: &mut dyn ReadSeek, raw: &RawHeader) -> Result<u64> {
    find_trailer_magic(file, raw, &SAMSUNG_SEANDROID_MAGIC)?
        .ok_or_else(|| Error::SamsungMagicNotFound.into())
}

fn find_bump_magic(file: &mut dyn ReadSeek, raw: &RawHeader) -> Result<u64> {
    find_trailer_magic(file, raw, &BUMP_MAGIC)?.ok_or_else(|| Error::BumpMagicNotFound.into())
}

/// Populate the uniform header from the raw header fields.
pub(crate) fn convert_header(raw: &RawHeader) -> Result<Header> {
    let name =
        str::from_utf8(raw.name.trim_end_padding()).map_err(|_| Error::StringNotUtf8("name"))?;
    let cmdline = str::from_utf8(raw.cmdline.trim_end_padding())
        .map_err(|_| Error::StringNotUtf8("cmdline"))?;

    let mut header = Header::new();
    header.set_supported_fields(SUPPORTED_FIELDS);

    (|| {
        header.set_board_name(Some(name.to_owned()))?;
        header.set_kernel_cmdline(Some(cmdline.to_owned()))?;
        header.set_page_size(Some(raw.page_size.get()))?;
        header.set_kernel_address(Some(raw.kernel_addr.get()))?;
        header.set_ramdisk_address(Some(raw.ramdisk_addr.get()))?;
        header.set_secondboot_address(Some(raw.second_addr.get()))?;
        header.set_kernel_tags_address(Some(raw.tags_addr.get()))
    })()
    .map_err(Error::HeaderSetFieldsFailed)?;

    Ok(header)
}

/// Stage a raw header from the caller-supplied uniform header. Shared by the
/// Android, Bump, Loki, and Mtk writers, which all use this header layout.
pub(crate) fn stage_header(header: &Header) -> Result<RawHeader> {
    let mut raw = RawHeader::new_zeroed();
    raw.magic = BOOT_MAGIC;

    if let Some(addr) = header.kernel_address() {
        raw.kernel_addr = addr.into();
    }
    if let Some(addr) = header.ramdisk_address() {
        raw.ramdisk_addr = addr.into();
    }
    if let Some(addr) = header.secondboot_address() {
        raw.second_addr = addr.into();
    }
    if let Some(addr) = header.kernel_tags_address() {
        raw.tags_addr = addr.into();
    }

    let page_size = header.page_size().unwrap_or(0);
    match page_size {
        2048 | 4096 | 8192 | 16384 | 32768 | 65536 | 131072 => {
            raw.page_size = page_size.into();
        }
        n => return Err(Error::InvalidPageSize(n).into()),
    }

    if let Some(name) = header.board_name() {
        raw.name = name
            .as_bytes()
            .to_padded_array::<BOOT_NAME_SIZE>()
            .ok_or(Error::StringTooLong("name"))?;
    }
    if let Some(cmdline) = header.kernel_cmdline() {
        raw.cmdline = cmdline
            .as_bytes()
            .to_padded_array::<BOOT_ARGS_SIZE>()
            .ok_or(Error::StringTooLong("cmdline"))?;
    }

    Ok(raw)
}

fn sha1_context() -> Context {
    Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY)
}

/// Reader for the Android format and its Bump variant. The two differ only in
/// which trailer magic contributes to the bid.
pub struct AndroidReader {
    hdr: Option<RawHeader>,
    header_offset: Option<u64>,
    // Truncated device tree images are allowed by default.
    allow_truncated_dt: bool,
    is_bump: bool,
    seg: SegmentReader,
}

impl AndroidReader {
    pub fn new() -> Self {
        Self::with_variant(false)
    }

    pub fn new_bump() -> Self {
        Self::with_variant(true)
    }

    fn with_variant(is_bump: bool) -> Self {
        Self {
            hdr: None,
            header_offset: None,
            allow_truncated_dt: true,
            is_bump,
            seg: SegmentReader::new(),
        }
    }

    fn bid_common(&mut self, file: &mut dyn ReadSeek, best_bid: i32) -> Result<Bid> {
        let trailer_magic_len = if self.is_bump {
            BUMP_MAGIC.len()
        } else {
            SAMSUNG_SEANDROID_MAGIC.len()
        };

        if best_bid >= ((BOOT_MAGIC.len() + trailer_magic_len) * 8) as i32 {
            // This is a bid we can't win, so bail out.
            return Ok(Bid::Unwinnable);
        }

        let mut bid = 0;

        let (raw, offset) = match find_header(file, MAX_HEADER_OFFSET) {
            Ok(found) => found,
            Err(LibError::Android(Error::HeaderNotFound | Error::HeaderOutOfBounds(_))) => {
                // This can't be an Android boot image.
                return Ok(Bid::Score(0));
            }
            Err(e) => return Err(e),
        };
        bid += (BOOT_MAGIC.len() * 8) as i32;

        let trailer = if self.is_bump {
            find_bump_magic(file, &raw)
        } else {
            find_samsung_seandroid_magic(file, &raw)
        };
        match trailer {
            Ok(_) => bid += (trailer_magic_len * 8) as i32,
            Err(LibError::Android(Error::SamsungMagicNotFound | Error::BumpMagicNotFound)) => {
                // Nothing found. Don't change the bid.
            }
            Err(e) => return Err(e),
        }

        self.hdr = Some(raw);
        self.header_offset = Some(offset);

        Ok(Bid::Score(bid))
    }
}

impl FormatReader for AndroidReader {
    fn format(&self) -> FormatCode {
        if self.is_bump {
            FormatCode::Bump
        } else {
            FormatCode::Android
        }
    }

    fn set_option(&mut self, key: &str, value: &str) -> Result<bool> {
        if key != "strict" {
            return Ok(false);
        }

        let strict = if ["true", "yes", "y", "1"]
            .iter()
            .any(|v| value.eq_ignore_ascii_case(v))
        {
            true
        } else if ["false", "no", "n", "0"]
            .iter()
            .any(|v| value.eq_ignore_ascii_case(v))
        {
            false
        } else {
            return Err(LibError::InvalidArgument("strict must be a boolean"));
        };

        self.allow_truncated_dt = !strict;
        Ok(true)
    }

    fn bid(&mut self, file: &mut dyn ReadSeek, best_bid: i32) -> Result<Bid> {
        self.bid_common(file, best_bid)
    }

    fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header> {
        let (raw, header_offset) = match (self.hdr, self.header_offset) {
            (Some(raw), Some(offset)) => (raw, offset),
            _ => {
                // A bid might not have been performed if the caller forced
                // this format.
                let found = find_header(file, MAX_HEADER_OFFSET)?;
                self.hdr = Some(found.0);
                self.header_offset = Some(found.1);
                found
            }
        };

        if raw.page_size.get() == 0 {
            return Err(Error::InvalidPageSize(0).into());
        }

        let header = convert_header(&raw)?;
        let offsets = section_offsets(&raw, header_offset);
        let file_size = file.seek(SeekFrom::End(0))?;

        // The device tree is exempt here: truncated dt segments are handled
        // through the segment engine's truncation support.
        for (name, offset, size) in [
            ("kernel_size", offsets.kernel, raw.kernel_size.get()),
            ("ramdisk_size", offsets.ramdisk, raw.ramdisk_size.get()),
            ("second_size", offsets.second, raw.second_size.get()),
        ] {
            if offset + u64::from(size) > file_size {
                return Err(Error::FieldOutOfBounds(name).into());
            }
        }

        let mut entries = vec![];

        if raw.kernel_size.get() > 0 {
            entries.push(SegmentReaderEntry {
                ty: EntryType::Kernel,
                offset: offsets.kernel,
                size: raw.kernel_size.get(),
                allow_truncation: false,
            });
        }
        if raw.ramdisk_size.get() > 0 {
            entries.push(SegmentReaderEntry {
                ty: EntryType::Ramdisk,
                offset: offsets.ramdisk,
                size: raw.ramdisk_size.get(),
                allow_truncation: false,
            });
        }
        if raw.second_size.get() > 0 {
            entries.push(SegmentReaderEntry {
                ty: EntryType::SecondBoot,
                offset: offsets.second,
                size: raw.second_size.get(),
                allow_truncation: false,
            });
        }
        if raw.dt_size.get() > 0 {
            entries.push(SegmentReaderEntry {
                ty: EntryType::DeviceTree,
                offset: offsets.dt,
                size: raw.dt_size.get(),
                allow_truncation: self.allow_truncated_dt,
            });
        }

        self.seg.set_entries(entries)?;

        Ok(header)
    }

    fn read_entry(&mut self, file: &mut dyn ReadSeek) -> Result<Entry> {
        Ok(self.seg.read_entry(file)?)
    }

    fn go_to_entry(&mut self, file: &mut dyn ReadSeek, ty: EntryType) -> Result<Entry> {
        Ok(self.seg.go_to_entry(file, ty)?)
    }

    fn read_data(&mut self, file: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize> {
        Ok(self.seg.read_data(file, buf)?)
    }
}

/// Writer for the Android format and its Bump variant. Payload sections are
/// streamed after a blank first page; the header is back-patched at close
/// once the section sizes and the SHA-1 `id` are known.
pub struct AndroidWriter {
    hdr: RawHeader,
    is_bump: bool,
    sha: Context,
    seg: SegmentWriter,
}

impl AndroidWriter {
    pub fn new() -> Self {
        Self::with_variant(false)
    }

    pub fn new_bump() -> Self {
        Self::with_variant(true)
    }

    fn with_variant(is_bump: bool) -> Self {
        Self {
            hdr: RawHeader::new_zeroed(),
            is_bump,
            sha: sha1_context(),
            seg: SegmentWriter::new(),
        }
    }
}

impl FormatWriter for AndroidWriter {
    fn format(&self) -> FormatCode {
        if self.is_bump {
            FormatCode::Bump
        } else {
            FormatCode::Android
        }
    }

    fn get_header(&self) -> Header {
        let mut header = Header::new();
        header.set_supported_fields(SUPPORTED_FIELDS);
        header
    }

    fn write_header(&mut self, file: &mut dyn ReadWriteSeek, header: &Header) -> Result<()> {
        self.hdr = stage_header(header)?;
        self.sha = sha1_context();

        let align = u64::from(self.hdr.page_size.get());

        self.seg.set_entries(vec![
            SegmentWriterEntry {
                ty: EntryType::Kernel,
                offset: 0,
                size: None,
                align,
            },
            SegmentWriterEntry {
                ty: EntryType::Ramdisk,
                offset: 0,
                size: None,
                align,
            },
            SegmentWriterEntry {
                ty: EntryType::SecondBoot,
                offset: 0,
                size: None,
                align,
            },
            SegmentWriterEntry {
                ty: EntryType::DeviceTree,
                offset: 0,
                size: None,
                align,
            },
        ])?;

        // Payload starts after the first page. The header is written at
        // close once the section sizes are known.
        file.seek(SeekFrom::Start(align))?;

        Ok(())
    }

    fn get_entry(&mut self, _file: &mut dyn ReadWriteSeek) -> Result<Entry> {
        Ok(self.seg.get_entry()?)
    }

    fn write_entry(&mut self, file: &mut dyn ReadWriteSeek, entry: &Entry) -> Result<()> {
        Ok(self.seg.write_entry(file, entry)?)
    }

    fn write_data(&mut self, file: &mut dyn ReadWriteSeek, buf: &[u8]) -> Result<usize> {
        let n = self.seg.write_data(file, buf)?;
        self.sha.update(&buf[..n]);
        Ok(n)
    }

    fn finish_entry(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        self.seg.finish_entry(file)?;

        if let Some(entry) = self.seg.last_finished() {
            if let Some(size) = entry.size {
                // The id hashes each section's data followed by its size.
                self.sha.update(&size.to_le_bytes());

                match entry.ty {
                    EntryType::Kernel => self.hdr.kernel_size = size.into(),
                    EntryType::Ramdisk => self.hdr.ramdisk_size = size.into(),
                    EntryType::SecondBoot => self.hdr.second_size = size.into(),
                    EntryType::DeviceTree => self.hdr.dt_size = size.into(),
                    _ => {}
                }
            }
        }

        Ok(())
    }

    fn close(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        // Only a fully-written image gets finalized. A partial image is the
        // caller's to delete.
        if self.seg.is_complete() {
            file.seek(SeekFrom::End(0))?;

            if self.is_bump {
                file.write_all(&BUMP_MAGIC)?;
            } else {
                file.write_all(&SAMSUNG_SEANDROID_MAGIC)?;
            }

            let digest = self.sha.clone().finish();
            let id = self.hdr.id.as_mut_bytes();
            id[..digest.as_ref().len()].copy_from_slice(digest.as_ref());

            file.seek(SeekFrom::Start(0))?;
            self.hdr.write_to_io(&mut *file)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use zerocopy::{FromBytes, FromZeros, IntoBytes};

    use crate::error::Error as LibError;

    use super::{Error, RawHeader, BOOT_MAGIC, MAX_HEADER_OFFSET};

    fn raw_image_with_header_at(offset: usize) -> Vec<u8> {
        let mut raw = RawHeader::new_zeroed();
        raw.magic = BOOT_MAGIC;
        raw.page_size = 2048.into();

        let mut data = vec![0u8; offset];
        data.extend_from_slice(raw.as_bytes());
        data
    }

    #[test]
    fn header_at_offset_zero() {
        let mut file = Cursor::new(raw_image_with_header_at(0));
        let (_, offset) = super::find_header(&mut file, MAX_HEADER_OFFSET).unwrap();
        assert_eq!(offset, 0);
    }

    #[test]
    fn header_at_last_allowed_offset() {
        let mut file = Cursor::new(raw_image_with_header_at(511));
        let (_, offset) = super::find_header(&mut file, MAX_HEADER_OFFSET).unwrap();
        assert_eq!(offset, 511);
    }

    #[test]
    fn header_past_limit_not_found() {
        let mut file = Cursor::new(raw_image_with_header_at(512));
        assert!(matches!(
            super::find_header(&mut file, MAX_HEADER_OFFSET),
            Err(LibError::Android(Error::HeaderNotFound))
        ));
    }

    #[test]
    fn file_smaller_than_header() {
        let mut data = raw_image_with_header_at(16);
        data.truncate(100);

        let mut file = Cursor::new(data);
        assert!(matches!(
            super::find_header(&mut file, MAX_HEADER_OFFSET),
            Err(LibError::Android(Error::HeaderOutOfBounds(16)))
        ));
    }

    #[test]
    fn raw_header_round_trips_through_bytes() {
        let mut raw = RawHeader::new_zeroed();
        raw.magic = BOOT_MAGIC;
        raw.kernel_size = 0x11223344.into();
        raw.page_size = 2048.into();

        let bytes = raw.as_bytes().to_vec();
        let (parsed, _) = RawHeader::read_from_prefix(&bytes).unwrap();

        assert_eq!(parsed.as_bytes(), bytes);
        assert_eq!(parsed.kernel_size.get(), 0x11223344);
    }
}
