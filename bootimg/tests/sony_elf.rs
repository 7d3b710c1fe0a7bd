/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use bootimg::{
    entry::{Entry, EntryType},
    error::Error,
    format::{sony_elf, FormatCode},
    reader::Reader,
    stream::{Reopen, SharedCursor},
    writer::Writer,
};

fn read_all_entries(reader: &mut Reader) -> Vec<(EntryType, Vec<u8>)> {
    let mut result = vec![];

    loop {
        let entry = match reader.read_entry() {
            Ok(entry) => entry,
            Err(e) if e.is_end_of_entries() => break,
            Err(e) => panic!("Failed to read entry: {e:?}"),
        };

        let mut data = vec![];
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read_data(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }

        result.push((entry.entry_type(), data));
    }

    result
}

#[test]
fn round_trip() {
    let file = SharedCursor::new();

    let mut writer = Writer::new();
    writer.set_format_sony_elf().unwrap();
    writer.open(Box::new(file.reopen().unwrap())).unwrap();

    let mut header = writer.get_header().unwrap();
    header.set_kernel_address(Some(0x40008000)).unwrap();
    header.set_ramdisk_address(Some(0x41000000)).unwrap();
    header
        .set_kernel_cmdline(Some("console=ttyS0".to_owned()))
        .unwrap();
    writer.write_header(&header).unwrap();

    let kernel = b"K".repeat(1024);
    let ramdisk = b"R".repeat(512);

    let payloads = [
        (EntryType::Kernel, kernel.as_slice()),
        (EntryType::Ramdisk, ramdisk.as_slice()),
        (EntryType::SonyIpl, b"".as_slice()),
        (EntryType::SonyRpm, b"".as_slice()),
        (EntryType::SonyAppsbl, b"".as_slice()),
    ];

    for (ty, data) in payloads {
        let entry = writer.get_entry().unwrap();
        assert_eq!(entry.entry_type(), ty);

        writer.write_entry(&Entry::new(ty)).unwrap();
        writer.write_data(data).unwrap();
        writer.finish_entry().unwrap();
    }

    writer.close().unwrap();

    let mut reader = Reader::new();
    reader.enable_format_all().unwrap();
    reader.open(Box::new(file.reopen().unwrap())).unwrap();
    assert_eq!(reader.format(), Some(FormatCode::SonyElf));
    assert_eq!(reader.format_name(), Some("sony_elf"));

    let read_header = reader.read_header().unwrap();

    // e_entry falls back to the kernel address on write.
    assert_eq!(read_header.entrypoint_address(), Some(0x40008000));
    assert_eq!(read_header.kernel_address(), Some(0x40008000));
    assert_eq!(read_header.ramdisk_address(), Some(0x41000000));
    assert_eq!(read_header.kernel_cmdline(), Some("console=ttyS0"));

    // Empty IPL/RPM/APPSBL segments have no program headers, so only the
    // kernel and ramdisk come back.
    let entries = read_all_entries(&mut reader);
    assert_eq!(
        entries,
        vec![
            (EntryType::Kernel, kernel),
            (EntryType::Ramdisk, ramdisk),
        ],
    );
}

fn push_u16(data: &mut Vec<u8>, value: u16) {
    data.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(data: &mut Vec<u8>, value: u32) {
    data.extend_from_slice(&value.to_le_bytes());
}

fn raw_elf_header(phnum: u16) -> Vec<u8> {
    let mut data = vec![];

    data.extend_from_slice(&sony_elf::SONY_E_IDENT);
    data.extend_from_slice(&[0u8; 7]); // rest of e_ident
    push_u16(&mut data, 2); // e_type
    push_u16(&mut data, 40); // e_machine
    push_u32(&mut data, 1); // e_version
    push_u32(&mut data, 0x40008000); // e_entry
    push_u32(&mut data, 52); // e_phoff
    push_u32(&mut data, 0); // e_shoff
    push_u32(&mut data, 0); // e_flags
    push_u16(&mut data, 52); // e_ehsize
    push_u16(&mut data, 32); // e_phentsize
    push_u16(&mut data, phnum); // e_phnum
    push_u16(&mut data, 0); // e_shentsize
    push_u16(&mut data, 0); // e_shnum
    push_u16(&mut data, 0); // e_shstrndx

    data
}

fn raw_program_header(ty: u32, flags: u32, offset: u32, size: u32) -> Vec<u8> {
    let mut data = vec![];

    push_u32(&mut data, ty);
    push_u32(&mut data, offset);
    push_u32(&mut data, 0x40008000); // p_vaddr
    push_u32(&mut data, 0x40008000); // p_paddr
    push_u32(&mut data, size); // p_filesz
    push_u32(&mut data, size); // p_memsz
    push_u32(&mut data, flags);
    push_u32(&mut data, 0); // p_align

    data
}

#[test]
fn unknown_type_or_flags_rejected() {
    let mut data = raw_elf_header(1);
    // PT_DYNAMIC is not something a Sony boot image would contain.
    data.extend_from_slice(&raw_program_header(6, 0, 4096, 16));
    data.resize(8192, 0);

    let mut reader = Reader::new();
    reader.enable_format_all().unwrap();
    reader.open(Box::new(std::io::Cursor::new(data))).unwrap();
    assert_eq!(reader.format(), Some(FormatCode::SonyElf));

    let err = reader.read_header().unwrap_err();
    assert!(matches!(
        err,
        Error::SonyElf(sony_elf::Error::InvalidTypeOrFlagsField {
            ty: 6,
            flags: 0,
            index: 0,
        })
    ));
}

#[test]
fn signature_segment_skipped() {
    let mut data = raw_elf_header(2);
    // Kernel segment, then a SIN signature segment the reader must skip.
    data.extend_from_slice(&raw_program_header(1, 0, 4096, 4));
    data.extend_from_slice(&raw_program_header(0x80000000, 0, 4100, 16));
    data.resize(4096, 0);
    data.extend_from_slice(b"KERNsignature-data--");
    data.resize(8192, 0);

    let mut reader = Reader::new();
    reader.enable_format_all().unwrap();
    reader.open(Box::new(std::io::Cursor::new(data))).unwrap();

    reader.read_header().unwrap();
    let entries = read_all_entries(&mut reader);

    assert_eq!(entries, vec![(EntryType::Kernel, b"KERN".to_vec())]);
}

#[test]
fn cmdline_too_long_rejected() {
    let mut data = raw_elf_header(1);
    // Cmdline program header claiming 512 bytes (the limit is 511).
    data.extend_from_slice(&raw_program_header(4, 0, 4096, 512));
    data.resize(8192, 0);

    let mut reader = Reader::new();
    reader.enable_format_all().unwrap();
    reader.open(Box::new(std::io::Cursor::new(data))).unwrap();

    let err = reader.read_header().unwrap_err();
    assert!(matches!(
        err,
        Error::SonyElf(sony_elf::Error::KernelCmdlineTooLong)
    ));
}
