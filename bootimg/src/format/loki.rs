// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{Seek, SeekFrom, Write},
    mem,
};

use byteorder::{LittleEndian, ReadBytesExt};
use ring::digest::Context;
use thiserror::Error;
use tracing::debug;
use zerocopy::{little_endian, FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryType},
    error::{Error as LibError, Result},
    format::{
        android::{self, RawHeader},
        padding,
        segment::{SegmentReader, SegmentReaderEntry, SegmentWriter, SegmentWriterEntry},
        Bid, FormatCode, FormatReader, FormatWriter,
    },
    header::Header,
    stream::{self, read_retry, ReadSeek, ReadWriteSeek},
};

pub const LOKI_MAGIC: [u8; 4] = *b"LOKI";
pub const LOKI_MAGIC_OFFSET: u64 = 0x400;

/// Old Loki images store neither the original ramdisk address nor size. The
/// address is only recoverable as this fixed offset from the kernel address
/// (the jflte value the patcher assumed).
const OLD_RAMDISK_ADDR_OFFSET: u32 = 0x01ff_8000;

/// Default kernel/tags load offsets from the unpatched jflte images; old
/// Loki images carry a bogus tags address, so it is reconstructed from these.
const DEFAULT_KERNEL_OFFSET: u32 = 0x8000;
const DEFAULT_TAGS_OFFSET: u32 = 0x100;

/// Thumb shellcode the Loki patcher injects. The trailing 0xff words are
/// placeholders; the patched ramdisk address occupies the last word before
/// the NULL terminator.
const LOKI_SHELLCODE: &[u8] =
    b"\xfe\xb5\x0d\x4d\xd5\xf8\x88\x04\xab\x68\x98\x42\x12\xd0\xd5\xf8\
      \x90\x64\x0a\x4c\xd5\xf8\x8c\x74\x07\xf5\x80\x57\x0f\xce\x0f\xc4\
      \x10\x3f\xfb\xdc\xd5\xf8\x88\x04\x04\x49\x08\x60\x03\x49\x08\x60\
      \x01\x60\x02\x60\x01\x20\x70\x47\xff\xff\xff\xff\xff\xff\xff\xff\
      \x00";

/// Size of the aboot copy Loki stores at the end of non-LG images.
const ABOOT_RESERVE_SIZE: u64 = 0x200;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Loki magic not found at offset {LOKI_MAGIC_OFFSET:#x}")]
    LokiHeaderNotFound,
    #[error("Page size cannot be zero")]
    PageSizeCannotBeZero,
    #[error("Ramdisk address not found in shellcode")]
    RamdiskAddressNotFound,
    #[error("No gzip headers found in the ramdisk area")]
    GzipOffsetNotFound,
    #[error("Ramdisk size is out of bounds")]
    RamdiskSizeOutOfBounds,
    #[error("Kernel size is out of bounds: {0}")]
    KernelSizeOutOfBounds(u32),
}

/// Raw on-disk layout of the Loki header at [`LOKI_MAGIC_OFFSET`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawLokiHeader {
    /// Magic value. This should be equal to [`LOKI_MAGIC`].
    magic: [u8; 4],
    /// 0 for boot images, 1 for recovery images.
    recovery: little_endian::U32,
    build: [u8; 128],
    orig_kernel_size: little_endian::U32,
    orig_ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
}

/// LG bootloaders load the ramdisk outside the address range other devices
/// use, which changes how much space the patcher reserved for aboot.
fn is_lg_ramdisk_address(addr: u32) -> bool {
    addr > 0x88f0_0000 || addr < 0x0fa0_0000
}

fn aboot_reserve_size(raw: &RawHeader) -> u64 {
    if is_lg_ramdisk_address(raw.ramdisk_addr.get()) {
        u64::from(raw.page_size.get())
    } else {
        ABOOT_RESERVE_SIZE
    }
}

fn find_loki_header(file: &mut dyn ReadSeek) -> Result<RawLokiHeader> {
    file.seek(SeekFrom::Start(LOKI_MAGIC_OFFSET))?;

    let mut buf = [0u8; mem::size_of::<RawLokiHeader>()];
    let n = read_retry(&mut *file, &mut buf)?;

    if n < buf.len() {
        return Err(Error::LokiHeaderNotFound.into());
    }

    let (raw, _) = RawLokiHeader::read_from_prefix(&buf[..])
        .map_err(|_| LibError::from(Error::LokiHeaderNotFound))?;

    if raw.magic != LOKI_MAGIC {
        return Err(Error::LokiHeaderNotFound.into());
    }

    Ok(raw)
}

/// Recover the original ramdisk address. New-style images embed it in the
/// shellcode; for old-style images only the fixed jflte offset is available.
fn find_ramdisk_address(
    file: &mut dyn ReadSeek,
    raw: &RawHeader,
    loki: &RawLokiHeader,
) -> Result<u32> {
    if loki.ramdisk_addr.get() == 0 {
        return Ok(raw.kernel_addr.get().wrapping_add(OLD_RAMDISK_ADDR_OFFSET));
    }

    let pattern = &LOKI_SHELLCODE[..LOKI_SHELLCODE.len() - 9];
    let Some(offset) = stream::search(file, 0, pattern)? else {
        return Err(Error::RamdiskAddressNotFound.into());
    };

    file.seek(SeekFrom::Start(offset + LOKI_SHELLCODE.len() as u64 - 5))?;
    let addr = file.read_u32::<LittleEndian>()?;

    debug!("Found ramdisk address {addr:#x} in shellcode at {offset:#x}");

    Ok(addr)
}

/// Old Loki images do not store the original kernel size, but the zImage
/// header does, at a fixed offset within the kernel.
/// (See the "Booting ARM Linux" article for the layout.)
fn find_linux_kernel_size(file: &mut dyn ReadSeek, kernel_offset: u64) -> Result<u32> {
    file.seek(SeekFrom::Start(kernel_offset + 0x2c))?;
    Ok(file.read_u32::<LittleEndian>()?)
}

/// Search for the gzip header of the compressed ramdisk. Both FLG = 0x00 and
/// FLG = 0x08 (FNAME) appear in practice; the FNAME variant is preferred
/// since most loki'd ramdisks carry one.
fn find_gzip_offset_old(file: &mut dyn ReadSeek, start_offset: u64) -> Result<u64> {
    const GZIP_DEFLATE_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

    let mut flag0_offset = None;
    let mut flag8_offset = None;

    let mut pos = start_offset;
    while let Some(offset) = stream::search(file, pos, &GZIP_DEFLATE_MAGIC)? {
        file.seek(SeekFrom::Start(offset + GZIP_DEFLATE_MAGIC.len() as u64))?;

        let mut flags = [0u8; 1];
        if read_retry(&mut *file, &mut flags)? == 1 {
            match flags[0] {
                0x00 if flag0_offset.is_none() => flag0_offset = Some(offset),
                0x08 if flag8_offset.is_none() => flag8_offset = Some(offset),
                _ => {}
            }
        }

        if flag8_offset.is_some() {
            break;
        }

        pos = offset + 1;
    }

    let offset = flag8_offset
        .or(flag0_offset)
        .ok_or(Error::GzipOffsetNotFound)?;

    debug!("Found gzip offset at {offset:#x}");

    Ok(offset)
}

/// The ramdisk runs from the gzip header up to the aboot copy Loki stores at
/// the end of the file.
fn find_ramdisk_size_old(
    file: &mut dyn ReadSeek,
    raw: &RawHeader,
    ramdisk_offset: u64,
) -> Result<u32> {
    let aboot_size = aboot_reserve_size(raw);
    let file_size = file.seek(SeekFrom::End(0))?;

    let available = file_size
        .checked_sub(aboot_size)
        .and_then(|end| end.checked_sub(ramdisk_offset))
        .ok_or(Error::RamdiskSizeOutOfBounds)?;

    u32::try_from(available).map_err(|_| Error::RamdiskSizeOutOfBounds.into())
}

struct SectionLayout {
    kernel_offset: u64,
    kernel_size: u32,
    ramdisk_offset: u64,
    ramdisk_size: u32,
    dt_offset: Option<u64>,
}

fn read_header_old(
    file: &mut dyn ReadSeek,
    raw: &RawHeader,
    loki: &RawLokiHeader,
) -> Result<(Header, SectionLayout)> {
    let page_size = raw.page_size.get();
    if page_size == 0 {
        return Err(Error::PageSizeCannotBeZero.into());
    }
    let psize = u64::from(page_size);

    // The kernel tags address is invalid in old Loki images; reconstruct the
    // default for the device the patcher assumed.
    let tags_addr = raw
        .kernel_addr
        .get()
        .wrapping_sub(DEFAULT_KERNEL_OFFSET)
        .wrapping_add(DEFAULT_TAGS_OFFSET);

    let kernel_size = find_linux_kernel_size(file, psize)?;

    let file_size = file.seek(SeekFrom::End(0))?;
    if u64::from(kernel_size) > file_size {
        return Err(Error::KernelSizeOutOfBounds(kernel_size).into());
    }

    // 0x200 covers the appended flattened device tree, if any.
    let gzip_offset = find_gzip_offset_old(file, psize + u64::from(kernel_size) + 0x200)?;

    let ramdisk_size = find_ramdisk_size_old(file, raw, gzip_offset)?;
    let ramdisk_addr = find_ramdisk_address(file, raw, loki)?;

    let mut header = android::convert_header(raw)?;
    header.set_ramdisk_address(Some(ramdisk_addr))?;
    header.set_kernel_tags_address(Some(tags_addr))?;

    Ok((
        header,
        SectionLayout {
            kernel_offset: psize,
            kernel_size,
            ramdisk_offset: gzip_offset,
            ramdisk_size,
            dt_offset: None,
        },
    ))
}

fn read_header_new(
    file: &mut dyn ReadSeek,
    raw: &RawHeader,
    loki: &RawLokiHeader,
) -> Result<(Header, SectionLayout)> {
    let page_size = raw.page_size.get();
    if page_size == 0 {
        return Err(Error::PageSizeCannotBeZero.into());
    }
    let psize = u64::from(page_size);

    let fake_size = aboot_reserve_size(raw);
    let ramdisk_addr = find_ramdisk_address(file, raw, loki)?;

    let kernel_size = loki.orig_kernel_size.get();
    let ramdisk_size = loki.orig_ramdisk_size.get();

    let mut header = android::convert_header(raw)?;
    header.set_ramdisk_address(Some(ramdisk_addr))?;

    let kernel_offset = psize;

    let mut pos = kernel_offset + u64::from(kernel_size);
    pos += padding::calc(pos, psize);
    let ramdisk_offset = pos;

    pos += u64::from(ramdisk_size);
    pos += padding::calc(pos, psize);
    let dt_offset = pos + fake_size;

    Ok((
        header,
        SectionLayout {
            kernel_offset,
            kernel_size,
            ramdisk_offset,
            ramdisk_size,
            dt_offset: Some(dt_offset),
        },
    ))
}

/// Reader for Loki-patched Android boot images. Old and new patcher versions
/// differ in how much of the original metadata is recoverable.
pub struct LokiReader {
    hdr: Option<RawHeader>,
    loki_hdr: Option<RawLokiHeader>,
    seg: SegmentReader,
}

impl LokiReader {
    pub fn new() -> Self {
        Self {
            hdr: None,
            loki_hdr: None,
            seg: SegmentReader::new(),
        }
    }
}

impl FormatReader for LokiReader {
    fn format(&self) -> FormatCode {
        FormatCode::Loki
    }

    fn bid(&mut self, file: &mut dyn ReadSeek, best_bid: i32) -> Result<Bid> {
        if best_bid >= ((LOKI_MAGIC.len() + android::BOOT_MAGIC.len()) * 8) as i32 {
            // This is a bid we can't win, so bail out.
            return Ok(Bid::Unwinnable);
        }

        let mut bid = 0;

        match find_loki_header(file) {
            Ok(loki) => {
                self.loki_hdr = Some(loki);
                bid += (LOKI_MAGIC.len() * 8) as i32;
            }
            Err(LibError::Loki(_)) => return Ok(Bid::Score(0)),
            Err(e) => return Err(e),
        }

        // The Android header must be at offset 0 for Loki images.
        match android::find_header(file, 1) {
            Ok((raw, _)) => {
                self.hdr = Some(raw);
                bid += (android::BOOT_MAGIC.len() * 8) as i32;
            }
            Err(LibError::Android(
                android::Error::HeaderNotFound | android::Error::HeaderOutOfBounds(_),
            )) => return Ok(Bid::Score(0)),
            Err(e) => return Err(e),
        }

        Ok(Bid::Score(bid))
    }

    fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header> {
        let loki = match self.loki_hdr {
            Some(loki) => loki,
            None => {
                // A bid might not have been performed if the caller forced
                // this format.
                let loki = find_loki_header(file)?;
                self.loki_hdr = Some(loki);
                loki
            }
        };
        let raw = match self.hdr {
            Some(raw) => raw,
            None => {
                let (raw, _) = android::find_header(file, 1)?;
                self.hdr = Some(raw);
                raw
            }
        };

        let new_style = loki.orig_kernel_size.get() != 0
            && loki.orig_ramdisk_size.get() != 0
            && loki.ramdisk_addr.get() != 0;

        let (header, layout) = if new_style {
            read_header_new(file, &raw, &loki)?
        } else {
            read_header_old(file, &raw, &loki)?
        };

        let mut entries = vec![];

        if layout.kernel_size > 0 {
            entries.push(SegmentReaderEntry {
                ty: EntryType::Kernel,
                offset: layout.kernel_offset,
                size: layout.kernel_size,
                allow_truncation: false,
            });
        }
        if layout.ramdisk_size > 0 {
            entries.push(SegmentReaderEntry {
                ty: EntryType::Ramdisk,
                offset: layout.ramdisk_offset,
                size: layout.ramdisk_size,
                allow_truncation: false,
            });
        }
        if let Some(dt_offset) = layout.dt_offset {
            if raw.dt_size.get() > 0 {
                entries.push(SegmentReaderEntry {
                    ty: EntryType::DeviceTree,
                    offset: dt_offset,
                    size: raw.dt_size.get(),
                    allow_truncation: false,
                });
            }
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

/// Writer producing new-style Loki images: an Android-layout image plus the
/// Loki header, the shellcode with the patched ramdisk address, and the
/// reserved aboot block between the ramdisk and the device tree.
pub struct LokiWriter {
    hdr: RawHeader,
    aboot: Vec<u8>,
    sha: Context,
    seg: SegmentWriter,
}

impl LokiWriter {
    pub fn new() -> Self {
        Self {
            hdr: RawHeader::new_zeroed(),
            aboot: vec![],
            sha: Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY),
            seg: SegmentWriter::new(),
        }
    }
}

impl FormatWriter for LokiWriter {
    fn format(&self) -> FormatCode {
        FormatCode::Loki
    }

    fn set_option(&mut self, key: &str, value: &str) -> Result<bool> {
        if key != "aboot" {
            return Ok(false);
        }

        self.aboot = fs::read(value)?;
        Ok(true)
    }

    fn get_header(&self) -> Header {
        let mut header = Header::new();
        header.set_supported_fields(android::SUPPORTED_FIELDS);
        header
    }

    fn write_header(&mut self, file: &mut dyn ReadWriteSeek, header: &Header) -> Result<()> {
        self.hdr = android::stage_header(header)?;
        self.sha = Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);

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
                ty: EntryType::DeviceTree,
                offset: 0,
                size: None,
                align,
            },
        ])?;

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

        let mut ramdisk_finished = false;

        if let Some(entry) = self.seg.last_finished() {
            if let Some(size) = entry.size {
                self.sha.update(&size.to_le_bytes());

                match entry.ty {
                    EntryType::Kernel => self.hdr.kernel_size = size.into(),
                    EntryType::Ramdisk => {
                        self.hdr.ramdisk_size = size.into();
                        ramdisk_finished = true;
                    }
                    EntryType::DeviceTree => self.hdr.dt_size = size.into(),
                    _ => {}
                }
            }
        }

        // The patcher keeps its copy of aboot between the ramdisk padding
        // and the device tree; the reader accounts for that gap.
        if ramdisk_finished {
            let reserve = aboot_reserve_size(&self.hdr) as usize;
            let mut block = vec![0u8; reserve];
            let n = reserve.min(self.aboot.len());
            block[..n].copy_from_slice(&self.aboot[..n]);
            file.write_all(&block)?;
        }

        Ok(())
    }

    fn close(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        if self.seg.is_complete() {
            let digest = self.sha.clone().finish();
            let id = self.hdr.id.as_mut_bytes();
            id[..digest.as_ref().len()].copy_from_slice(digest.as_ref());

            file.seek(SeekFrom::Start(0))?;
            self.hdr.write_to_io(&mut *file)?;

            let mut loki = RawLokiHeader::new_zeroed();
            loki.magic = LOKI_MAGIC;
            loki.orig_kernel_size = self.hdr.kernel_size;
            loki.orig_ramdisk_size = self.hdr.ramdisk_size;
            loki.ramdisk_addr = self.hdr.ramdisk_addr;

            file.seek(SeekFrom::Start(LOKI_MAGIC_OFFSET))?;
            loki.write_to_io(&mut *file)?;

            // Shellcode with the ramdisk address patched into its tail, so
            // the reader can recover the address the same way it would from
            // a real patched image.
            let mut shellcode = LOKI_SHELLCODE.to_vec();
            let len = shellcode.len();
            shellcode[len - 5..len - 1]
                .copy_from_slice(&self.hdr.ramdisk_addr.get().to_le_bytes());
            file.write_all(&shellcode)?;
        }

        Ok(())
    }
}
