// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Seek, SeekFrom},
    mem,
};

use byteorder::{LittleEndian, WriteBytesExt};
use thiserror::Error;
use zerocopy::{little_endian, FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryType},
    error::{Error as LibError, Result},
    format::{
        android::{self, RawHeader},
        segment::{SegmentReader, SegmentReaderEntry, SegmentWriter, SegmentWriterEntry},
        Bid, FormatCode, FormatReader, FormatWriter,
    },
    header::Header,
    stream::{read_retry, ReadSeek, ReadWriteSeek},
};

pub const MTK_MAGIC: [u8; 4] = [0x88, 0x16, 0x88, 0x58];
pub const MTK_TYPE_SIZE: usize = 32;

/// Size of one Mtk sub-header on disk.
pub const MTK_HEADER_SIZE: u32 = 512;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Mtk header not found at {0:?} section")]
    MtkHeaderNotFound(&'static str),
    #[error("Mtk kernel header says {mtk} bytes, Android header says {android}")]
    MismatchedKernelSize { mtk: u32, android: u32 },
    #[error("Mtk ramdisk header says {mtk} bytes, Android header says {android}")]
    MismatchedRamdiskSize { mtk: u32, android: u32 },
    #[error("{0:?} section is too small to hold an Mtk header")]
    SectionTooSmall(&'static str),
}

/// Raw on-disk layout of the 512-byte Mtk sub-header prefixing the kernel and
/// ramdisk sections.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub(crate) struct RawMtkHeader {
    /// Magic value. This should be equal to [`MTK_MAGIC`].
    pub magic: [u8; 4],
    /// Size of the section contents, excluding this header.
    pub size: little_endian::U32,
    /// Image type label, eg. `KERNEL` or `ROOTFS`.
    pub ty: [u8; MTK_TYPE_SIZE],
    pub unused: [u8; 472],
}

fn read_mtk_header(file: &mut dyn ReadSeek, offset: u64) -> Result<Option<RawMtkHeader>> {
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = [0u8; mem::size_of::<RawMtkHeader>()];
    let n = read_retry(&mut *file, &mut buf)?;

    if n < buf.len() {
        return Ok(None);
    }

    let Ok((raw, _)) = RawMtkHeader::read_from_prefix(&buf[..]) else {
        return Ok(None);
    };

    if raw.magic != MTK_MAGIC {
        return Ok(None);
    }

    Ok(Some(raw))
}

/// Reader for Mtk-flavored Android boot images: the standard layout with
/// 512-byte vendor sub-headers in front of the kernel and ramdisk.
pub struct MtkReader {
    hdr: Option<RawHeader>,
    header_offset: Option<u64>,
    seg: SegmentReader,
}

impl MtkReader {
    pub fn new() -> Self {
        Self {
            hdr: None,
            header_offset: None,
            seg: SegmentReader::new(),
        }
    }
}

impl FormatReader for MtkReader {
    fn format(&self) -> FormatCode {
        FormatCode::Mtk
    }

    fn bid(&mut self, file: &mut dyn ReadSeek, best_bid: i32) -> Result<Bid> {
        if best_bid >= ((android::BOOT_MAGIC.len() + 2 * MTK_MAGIC.len()) * 8) as i32 {
            // This is a bid we can't win, so bail out.
            return Ok(Bid::Unwinnable);
        }

        let mut bid = 0;

        let (raw, offset) = match android::find_header(file, android::MAX_HEADER_OFFSET) {
            Ok(found) => found,
            Err(LibError::Android(
                android::Error::HeaderNotFound | android::Error::HeaderOutOfBounds(_),
            )) => return Ok(Bid::Score(0)),
            Err(e) => return Err(e),
        };
        bid += (android::BOOT_MAGIC.len() * 8) as i32;

        if raw.page_size.get() > 0 {
            let offsets = android::section_offsets(&raw, offset);

            if read_mtk_header(file, offsets.kernel)?.is_some() {
                bid += (MTK_MAGIC.len() * 8) as i32;
            }
            if read_mtk_header(file, offsets.ramdisk)?.is_some() {
                bid += (MTK_MAGIC.len() * 8) as i32;
            }
        }

        self.hdr = Some(raw);
        self.header_offset = Some(offset);

        Ok(Bid::Score(bid))
    }

    fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header> {
        let (raw, header_offset) = match (self.hdr, self.header_offset) {
            (Some(raw), Some(offset)) => (raw, offset),
            _ => {
                // A bid might not have been performed if the caller forced
                // this format.
                let found = android::find_header(file, android::MAX_HEADER_OFFSET)?;
                self.hdr = Some(found.0);
                self.header_offset = Some(found.1);
                found
            }
        };

        if raw.page_size.get() == 0 {
            return Err(android::Error::InvalidPageSize(0).into());
        }

        let kernel_size = raw.kernel_size.get();
        let ramdisk_size = raw.ramdisk_size.get();

        if kernel_size < MTK_HEADER_SIZE {
            return Err(Error::SectionTooSmall("kernel").into());
        }
        if ramdisk_size < MTK_HEADER_SIZE {
            return Err(Error::SectionTooSmall("ramdisk").into());
        }

        let offsets = android::section_offsets(&raw, header_offset);

        let mtk_kernel = read_mtk_header(file, offsets.kernel)?
            .ok_or(Error::MtkHeaderNotFound("kernel"))?;
        let mtk_ramdisk = read_mtk_header(file, offsets.ramdisk)?
            .ok_or(Error::MtkHeaderNotFound("ramdisk"))?;

        if mtk_kernel.size.get() != kernel_size - MTK_HEADER_SIZE {
            return Err(Error::MismatchedKernelSize {
                mtk: mtk_kernel.size.get(),
                android: kernel_size - MTK_HEADER_SIZE,
            }
            .into());
        }
        if mtk_ramdisk.size.get() != ramdisk_size - MTK_HEADER_SIZE {
            return Err(Error::MismatchedRamdiskSize {
                mtk: mtk_ramdisk.size.get(),
                android: ramdisk_size - MTK_HEADER_SIZE,
            }
            .into());
        }

        let header = android::convert_header(&raw)?;

        let file_size = file.seek(SeekFrom::End(0))?;
        for (name, offset, size) in [
            ("kernel_size", offsets.kernel, kernel_size),
            ("ramdisk_size", offsets.ramdisk, ramdisk_size),
            ("second_size", offsets.second, raw.second_size.get()),
        ] {
            if offset + u64::from(size) > file_size {
                return Err(android::Error::FieldOutOfBounds(name).into());
            }
        }

        let mut entries = vec![
            SegmentReaderEntry {
                ty: EntryType::MtkKernelHeader,
                offset: offsets.kernel,
                size: MTK_HEADER_SIZE,
                allow_truncation: false,
            },
        ];

        if kernel_size > MTK_HEADER_SIZE {
            entries.push(SegmentReaderEntry {
                ty: EntryType::Kernel,
                offset: offsets.kernel + u64::from(MTK_HEADER_SIZE),
                size: kernel_size - MTK_HEADER_SIZE,
                allow_truncation: false,
            });
        }

        entries.push(SegmentReaderEntry {
            ty: EntryType::MtkRamdiskHeader,
            offset: offsets.ramdisk,
            size: MTK_HEADER_SIZE,
            allow_truncation: false,
        });

        if ramdisk_size > MTK_HEADER_SIZE {
            entries.push(SegmentReaderEntry {
                ty: EntryType::Ramdisk,
                offset: offsets.ramdisk + u64::from(MTK_HEADER_SIZE),
                size: ramdisk_size - MTK_HEADER_SIZE,
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
                allow_truncation: false,
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

/// Writer for Mtk-flavored images. The caller streams the 512-byte
/// sub-headers as entries, exactly as the reader exposes them; the size field
/// inside each sub-header is back-patched at close once the inner payload
/// sizes are known.
pub struct MtkWriter {
    hdr: RawHeader,
    seg: SegmentWriter,
}

impl MtkWriter {
    pub fn new() -> Self {
        Self {
            hdr: RawHeader::new_zeroed(),
            seg: SegmentWriter::new(),
        }
    }
}

impl FormatWriter for MtkWriter {
    fn format(&self) -> FormatCode {
        FormatCode::Mtk
    }

    fn get_header(&self) -> Header {
        let mut header = Header::new();
        header.set_supported_fields(android::SUPPORTED_FIELDS);
        header
    }

    fn write_header(&mut self, file: &mut dyn ReadWriteSeek, header: &Header) -> Result<()> {
        self.hdr = android::stage_header(header)?;

        let align = u64::from(self.hdr.page_size.get());

        // The sub-header and its payload form one padded Android section, so
        // only the payload halves carry the page alignment.
        self.seg.set_entries(vec![
            SegmentWriterEntry {
                ty: EntryType::MtkKernelHeader,
                offset: 0,
                size: Some(MTK_HEADER_SIZE),
                align: 0,
            },
            SegmentWriterEntry {
                ty: EntryType::Kernel,
                offset: 0,
                size: None,
                align,
            },
            SegmentWriterEntry {
                ty: EntryType::MtkRamdiskHeader,
                offset: 0,
                size: Some(MTK_HEADER_SIZE),
                align: 0,
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
        Ok(self.seg.write_data(file, buf)?)
    }

    fn finish_entry(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        Ok(self.seg.finish_entry(file)?)
    }

    fn close(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        if self.seg.is_complete() {
            let mut mtk_kernel_offset = 0;
            let mut mtk_ramdisk_offset = 0;
            let mut kernel_size = 0;
            let mut ramdisk_size = 0;

            for entry in self.seg.entries() {
                let size = entry.size.unwrap_or(0);

                match entry.ty {
                    EntryType::MtkKernelHeader => mtk_kernel_offset = entry.offset,
                    EntryType::MtkRamdiskHeader => mtk_ramdisk_offset = entry.offset,
                    EntryType::Kernel => kernel_size = size,
                    EntryType::Ramdisk => ramdisk_size = size,
                    EntryType::SecondBoot => self.hdr.second_size = size.into(),
                    EntryType::DeviceTree => self.hdr.dt_size = size.into(),
                    _ => {}
                }
            }

            // Each Android-level section includes the 512-byte sub-header.
            self.hdr.kernel_size = (kernel_size + MTK_HEADER_SIZE).into();
            self.hdr.ramdisk_size = (ramdisk_size + MTK_HEADER_SIZE).into();

            // Back-patch the size field inside each sub-header.
            file.seek(SeekFrom::Start(mtk_kernel_offset + 4))?;
            file.write_u32::<LittleEndian>(kernel_size)?;
            file.seek(SeekFrom::Start(mtk_ramdisk_offset + 4))?;
            file.write_u32::<LittleEndian>(ramdisk_size)?;

            file.seek(SeekFrom::Start(0))?;
            self.hdr.write_to_io(&mut *file)?;
        }

        Ok(())
    }
}
