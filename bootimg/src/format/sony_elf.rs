// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Read, Seek, SeekFrom, Write},
    mem,
};

use thiserror::Error;
use zerocopy::{little_endian, FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    entry::{Entry, EntryType},
    error::{Error as LibError, Result},
    format::{
        segment::{self, SegmentReader, SegmentReaderEntry, SegmentWriter, SegmentWriterEntry},
        Bid, FormatCode, FormatReader, FormatWriter,
    },
    header::{Header, HeaderFields},
    stream::{read_retry, ReadFixedSizeExt, ReadSeek, ReadWriteSeek},
};

pub const SONY_EI_NIDENT: usize = 9;

/// Sony's e_ident prefix: 32-bit little-endian ELF with the vendor OS ABI.
pub const SONY_E_IDENT: [u8; SONY_EI_NIDENT] = [0x7f, b'E', b'L', b'F', 1, 1, 1, 0x61, 0];

const SONY_E_TYPE_KERNEL: u32 = 1;
const SONY_E_FLAGS_KERNEL: u32 = 0;
const SONY_E_TYPE_RAMDISK: u32 = 1;
const SONY_E_FLAGS_RAMDISK: u32 = 0x8000_0000;
const SONY_E_TYPE_IPL: u32 = 1;
const SONY_E_FLAGS_IPL: u32 = 0x4000_0000;
const SONY_E_TYPE_RPM: u32 = 1;
const SONY_E_FLAGS_RPM: u32 = 0x0100_0000;
const SONY_E_TYPE_APPSBL: u32 = 1;
const SONY_E_FLAGS_APPSBL: u32 = 0x0200_0000;
const SONY_E_TYPE_CMDLINE: u32 = 4;
const SONY_E_FLAGS_CMDLINE: u32 = 0;
const SONY_E_TYPE_SIN: u32 = 0x8000_0000;

const CMDLINE_BUF_SIZE: u32 = 512;

/// Payloads start on the second 4 KiB page; the ELF and program headers are
/// back-patched into the first page at close.
const FIRST_PAYLOAD_OFFSET: u64 = 4096;

const SUPPORTED_FIELDS: HeaderFields = HeaderFields::KERNEL_CMDLINE
    .union(HeaderFields::KERNEL_ADDRESS)
    .union(HeaderFields::RAMDISK_ADDRESS)
    .union(HeaderFields::ENTRYPOINT_ADDRESS)
    .union(HeaderFields::SONY_IPL_ADDRESS)
    .union(HeaderFields::SONY_RPM_ADDRESS)
    .union(HeaderFields::SONY_APPSBL_ADDRESS);

#[derive(Debug, Error)]
pub enum Error {
    #[error("File is too small to hold a Sony ELF header")]
    SonyElfHeaderTooSmall,
    #[error("Invalid ELF magic")]
    InvalidElfMagic,
    #[error("Kernel cmdline in program header is too long")]
    KernelCmdlineTooLong,
    #[error("Invalid type ({ty:#010x}) or flags ({flags:#010x}) field in segment {index}")]
    InvalidTypeOrFlagsField { ty: u32, flags: u32, index: u16 },
}

/// Raw on-disk layout of the ELF file header, as Sony images use it.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawElfHeader {
    e_ident: [u8; 16],
    e_type: little_endian::U16,
    e_machine: little_endian::U16,
    e_version: little_endian::U32,
    e_entry: little_endian::U32,
    e_phoff: little_endian::U32,
    e_shoff: little_endian::U32,
    e_flags: little_endian::U32,
    e_ehsize: little_endian::U16,
    e_phentsize: little_endian::U16,
    e_phnum: little_endian::U16,
    e_shentsize: little_endian::U16,
    e_shnum: little_endian::U16,
    e_shstrndx: little_endian::U16,
}

/// Raw on-disk layout of one ELF32 program header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawProgramHeader {
    p_type: little_endian::U32,
    p_offset: little_endian::U32,
    p_vaddr: little_endian::U32,
    p_paddr: little_endian::U32,
    p_filesz: little_endian::U32,
    p_memsz: little_endian::U32,
    p_flags: little_endian::U32,
    p_align: little_endian::U32,
}

fn find_sony_elf_header(file: &mut dyn ReadSeek) -> Result<RawElfHeader> {
    file.seek(SeekFrom::Start(0))?;

    let mut buf = [0u8; mem::size_of::<RawElfHeader>()];
    let n = read_retry(&mut *file, &mut buf)?;

    if n < buf.len() {
        return Err(Error::SonyElfHeaderTooSmall.into());
    }

    let (raw, _) = RawElfHeader::read_from_prefix(&buf[..])
        .map_err(|_| LibError::from(Error::SonyElfHeaderTooSmall))?;

    if raw.e_ident[..SONY_EI_NIDENT] != SONY_E_IDENT {
        return Err(Error::InvalidElfMagic.into());
    }

    Ok(raw)
}

/// Reader for Sony ELF boot images. Program headers name the payload kinds
/// through vendor-specific `(p_type, p_flags)` pairs.
pub struct SonyElfReader {
    hdr: Option<RawElfHeader>,
    seg: SegmentReader,
}

impl SonyElfReader {
    pub fn new() -> Self {
        Self {
            hdr: None,
            seg: SegmentReader::new(),
        }
    }
}

impl FormatReader for SonyElfReader {
    fn format(&self) -> FormatCode {
        FormatCode::SonyElf
    }

    fn bid(&mut self, file: &mut dyn ReadSeek, best_bid: i32) -> Result<Bid> {
        if best_bid >= (SONY_EI_NIDENT * 8) as i32 {
            // This is a bid we can't win, so bail out.
            return Ok(Bid::Unwinnable);
        }

        match find_sony_elf_header(file) {
            Ok(raw) => {
                self.hdr = Some(raw);
                Ok(Bid::Score((SONY_EI_NIDENT * 8) as i32))
            }
            Err(LibError::SonyElf(_)) => Ok(Bid::Score(0)),
            Err(e) => Err(e),
        }
    }

    fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header> {
        let raw = match self.hdr {
            Some(raw) => raw,
            None => {
                // A bid might not have been performed if the caller forced
                // this format.
                let raw = find_sony_elf_header(file)?;
                self.hdr = Some(raw);
                raw
            }
        };

        let mut header = Header::new();
        header.set_supported_fields(SUPPORTED_FIELDS);
        header.set_entrypoint_address(Some(raw.e_entry.get()))?;

        let mut entries = vec![];
        let mut pos = mem::size_of::<RawElfHeader>() as u64;

        for i in 0..raw.e_phnum.get() {
            file.seek(SeekFrom::Start(pos))?;

            let mut buf = [0u8; mem::size_of::<RawProgramHeader>()];
            file.read_exact(&mut buf)?;
            let (phdr, _) = RawProgramHeader::read_from_prefix(&buf[..])
                .map_err(|_| LibError::from(Error::SonyElfHeaderTooSmall))?;

            pos += mem::size_of::<RawProgramHeader>() as u64;

            let ty = phdr.p_type.get();
            let flags = phdr.p_flags.get();

            if ty == SONY_E_TYPE_CMDLINE && flags == SONY_E_FLAGS_CMDLINE {
                if phdr.p_memsz.get() >= CMDLINE_BUF_SIZE {
                    return Err(Error::KernelCmdlineTooLong.into());
                }

                file.seek(SeekFrom::Start(u64::from(phdr.p_offset.get())))?;
                let data = file.read_vec_exact(phdr.p_memsz.get() as usize)?;
                let cmdline = String::from_utf8_lossy(&data).into_owned();

                header.set_kernel_cmdline(Some(cmdline))?;
            } else if ty == SONY_E_TYPE_KERNEL && flags == SONY_E_FLAGS_KERNEL {
                entries.push(SegmentReaderEntry {
                    ty: EntryType::Kernel,
                    offset: u64::from(phdr.p_offset.get()),
                    size: phdr.p_memsz.get(),
                    allow_truncation: false,
                });
                header.set_kernel_address(Some(phdr.p_vaddr.get()))?;
            } else if ty == SONY_E_TYPE_RAMDISK && flags == SONY_E_FLAGS_RAMDISK {
                entries.push(SegmentReaderEntry {
                    ty: EntryType::Ramdisk,
                    offset: u64::from(phdr.p_offset.get()),
                    size: phdr.p_memsz.get(),
                    allow_truncation: false,
                });
                header.set_ramdisk_address(Some(phdr.p_vaddr.get()))?;
            } else if ty == SONY_E_TYPE_IPL && flags == SONY_E_FLAGS_IPL {
                entries.push(SegmentReaderEntry {
                    ty: EntryType::SonyIpl,
                    offset: u64::from(phdr.p_offset.get()),
                    size: phdr.p_memsz.get(),
                    allow_truncation: false,
                });
                header.set_sony_ipl_address(Some(phdr.p_vaddr.get()))?;
            } else if ty == SONY_E_TYPE_RPM && flags == SONY_E_FLAGS_RPM {
                entries.push(SegmentReaderEntry {
                    ty: EntryType::SonyRpm,
                    offset: u64::from(phdr.p_offset.get()),
                    size: phdr.p_memsz.get(),
                    allow_truncation: false,
                });
                header.set_sony_rpm_address(Some(phdr.p_vaddr.get()))?;
            } else if ty == SONY_E_TYPE_APPSBL && flags == SONY_E_FLAGS_APPSBL {
                entries.push(SegmentReaderEntry {
                    ty: EntryType::SonyAppsbl,
                    offset: u64::from(phdr.p_offset.get()),
                    size: phdr.p_memsz.get(),
                    allow_truncation: false,
                });
                header.set_sony_appsbl_address(Some(phdr.p_vaddr.get()))?;
            } else if ty == SONY_E_TYPE_SIN {
                // The SIN segment holds an RSA signature that can't be
                // recreated without the private key; there's no point in
                // dumping it.
                continue;
            } else {
                return Err(Error::InvalidTypeOrFlagsField {
                    ty,
                    flags,
                    index: i,
                }
                .into());
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

/// Writer for Sony ELF boot images. Payloads are streamed starting at offset
/// 4096; the ELF header and the program headers for every nonzero segment
/// are back-patched at close. The cmdline travels as an internally generated
/// program header between the ramdisk and IPL segments.
pub struct SonyElfWriter {
    ehdr: RawElfHeader,
    phdr_kernel: RawProgramHeader,
    phdr_ramdisk: RawProgramHeader,
    phdr_cmdline: RawProgramHeader,
    phdr_ipl: RawProgramHeader,
    phdr_rpm: RawProgramHeader,
    phdr_appsbl: RawProgramHeader,
    cmdline: Vec<u8>,
    cmdline_written: bool,
    seg: SegmentWriter,
}

impl SonyElfWriter {
    pub fn new() -> Self {
        Self {
            ehdr: RawElfHeader::new_zeroed(),
            phdr_kernel: RawProgramHeader::new_zeroed(),
            phdr_ramdisk: RawProgramHeader::new_zeroed(),
            phdr_cmdline: RawProgramHeader::new_zeroed(),
            phdr_ipl: RawProgramHeader::new_zeroed(),
            phdr_rpm: RawProgramHeader::new_zeroed(),
            phdr_appsbl: RawProgramHeader::new_zeroed(),
            cmdline: vec![],
            cmdline_written: false,
            seg: SegmentWriter::new(),
        }
    }
}

impl FormatWriter for SonyElfWriter {
    fn format(&self) -> FormatCode {
        FormatCode::SonyElf
    }

    fn get_header(&self) -> Header {
        let mut header = Header::new();
        header.set_supported_fields(SUPPORTED_FIELDS);
        header
    }

    fn write_header(&mut self, file: &mut dyn ReadWriteSeek, header: &Header) -> Result<()> {
        self.cmdline.clear();
        self.cmdline_written = false;

        let mut ehdr = RawElfHeader::new_zeroed();
        ehdr.e_ident[..SONY_EI_NIDENT].copy_from_slice(&SONY_E_IDENT);
        ehdr.e_type = 2.into();
        ehdr.e_machine = 40.into();
        ehdr.e_version = 1.into();
        ehdr.e_phoff = (mem::size_of::<RawElfHeader>() as u32).into();
        ehdr.e_ehsize = (mem::size_of::<RawElfHeader>() as u16).into();
        ehdr.e_phentsize = (mem::size_of::<RawProgramHeader>() as u16).into();

        if let Some(addr) = header.entrypoint_address() {
            ehdr.e_entry = addr.into();
        } else if let Some(addr) = header.kernel_address() {
            ehdr.e_entry = addr.into();
        }

        self.ehdr = ehdr;

        let stage = |ty: u32, flags: u32, addr: Option<u32>| {
            let mut phdr = RawProgramHeader::new_zeroed();
            phdr.p_type = ty.into();
            phdr.p_flags = flags.into();
            if let Some(addr) = addr {
                phdr.p_vaddr = addr.into();
                phdr.p_paddr = addr.into();
            }
            phdr
        };

        self.phdr_kernel = stage(SONY_E_TYPE_KERNEL, SONY_E_FLAGS_KERNEL, header.kernel_address());
        self.phdr_ramdisk = stage(
            SONY_E_TYPE_RAMDISK,
            SONY_E_FLAGS_RAMDISK,
            header.ramdisk_address(),
        );
        self.phdr_cmdline = stage(SONY_E_TYPE_CMDLINE, SONY_E_FLAGS_CMDLINE, None);
        self.phdr_ipl = stage(SONY_E_TYPE_IPL, SONY_E_FLAGS_IPL, header.sony_ipl_address());
        self.phdr_rpm = stage(SONY_E_TYPE_RPM, SONY_E_FLAGS_RPM, header.sony_rpm_address());
        self.phdr_appsbl = stage(
            SONY_E_TYPE_APPSBL,
            SONY_E_FLAGS_APPSBL,
            header.sony_appsbl_address(),
        );

        if let Some(cmdline) = header.kernel_cmdline() {
            self.cmdline = cmdline.as_bytes().to_vec();
        }

        self.seg.set_entries(
            [
                EntryType::Kernel,
                EntryType::Ramdisk,
                EntryType::SonyIpl,
                EntryType::SonyRpm,
                EntryType::SonyAppsbl,
            ]
            .iter()
            .map(|&ty| SegmentWriterEntry {
                ty,
                offset: 0,
                size: None,
                align: 0,
            })
            .collect(),
        )?;

        file.seek(SeekFrom::Start(FIRST_PAYLOAD_OFFSET))?;

        Ok(())
    }

    fn get_entry(&mut self, file: &mut dyn ReadWriteSeek) -> Result<Entry> {
        let entry = self.seg.get_entry()?;

        // The cmdline is not caller-visible; emit it when the cursor crosses
        // from the ramdisk to the IPL segment.
        if entry.entry_type() == EntryType::SonyIpl && !self.cmdline_written {
            let offset = file.stream_position()?;
            let offset = u32::try_from(offset)
                .map_err(|_| segment::Error::InvalidSize(offset))?;

            file.write_all(&self.cmdline)?;

            self.phdr_cmdline.p_offset = offset.into();
            self.phdr_cmdline.p_filesz = (self.cmdline.len() as u32).into();
            self.phdr_cmdline.p_memsz = (self.cmdline.len() as u32).into();
            self.cmdline_written = true;
        }

        Ok(entry)
    }

    fn write_entry(&mut self, file: &mut dyn ReadWriteSeek, entry: &Entry) -> Result<()> {
        Ok(self.seg.write_entry(file, entry)?)
    }

    fn write_data(&mut self, file: &mut dyn ReadWriteSeek, buf: &[u8]) -> Result<usize> {
        Ok(self.seg.write_data(file, buf)?)
    }

    fn finish_entry(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        self.seg.finish_entry(file)?;

        if let Some(entry) = self.seg.last_finished() {
            let size = entry.size.unwrap_or(0);
            let offset = u32::try_from(entry.offset)
                .map_err(|_| segment::Error::InvalidSize(entry.offset))?;

            let phdr = match entry.ty {
                EntryType::Kernel => &mut self.phdr_kernel,
                EntryType::Ramdisk => &mut self.phdr_ramdisk,
                EntryType::SonyIpl => &mut self.phdr_ipl,
                EntryType::SonyRpm => &mut self.phdr_rpm,
                EntryType::SonyAppsbl => &mut self.phdr_appsbl,
                _ => return Ok(()),
            };

            phdr.p_offset = offset.into();
            phdr.p_filesz = size.into();
            phdr.p_memsz = size.into();
        }

        Ok(())
    }

    fn close(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()> {
        if self.seg.is_complete() {
            let phdrs = [
                self.phdr_kernel,
                self.phdr_ramdisk,
                self.phdr_cmdline,
                self.phdr_ipl,
                self.phdr_rpm,
                self.phdr_appsbl,
            ];

            let phnum = phdrs.iter().filter(|p| p.p_filesz.get() > 0).count();
            self.ehdr.e_phnum = (phnum as u16).into();

            file.seek(SeekFrom::Start(0))?;
            self.ehdr.write_to_io(&mut *file)?;

            for phdr in &phdrs {
                if phdr.p_filesz.get() > 0 {
                    phdr.write_to_io(&mut *file)?;
                }
            }
        }

        Ok(())
    }
}
