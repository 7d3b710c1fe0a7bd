/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use bootimg::{
    entry::{Entry, EntryType},
    format::FormatCode,
    reader::Reader,
    stream::{Reopen, SharedCursor},
    writer::Writer,
};

const MTK_MAGIC: [u8; 4] = [0x88, 0x16, 0x88, 0x58];

/// A 512-byte Mtk sub-header with the given type label and size field.
fn mtk_header_blob(label: &[u8], size: u32) -> Vec<u8> {
    let mut blob = vec![];
    blob.extend_from_slice(&MTK_MAGIC);
    blob.extend_from_slice(&size.to_le_bytes());

    let mut ty = [0u8; 32];
    ty[..label.len()].copy_from_slice(label);
    blob.extend_from_slice(&ty);

    blob.extend_from_slice(&[0xffu8; 472]);
    blob
}

#[test]
fn round_trip() {
    let file = SharedCursor::new();

    let mut writer = Writer::new();
    writer.set_format_mtk().unwrap();
    writer.open(Box::new(file.reopen().unwrap())).unwrap();

    let mut header = writer.get_header().unwrap();
    header.set_board_name(Some("mtk".to_owned())).unwrap();
    header
        .set_kernel_cmdline(Some("console=ttyMT0".to_owned()))
        .unwrap();
    header.set_page_size(Some(2048)).unwrap();
    header.set_kernel_address(Some(0x10008000)).unwrap();
    header.set_ramdisk_address(Some(0x11000000)).unwrap();
    header.set_secondboot_address(Some(0x12000000)).unwrap();
    header.set_kernel_tags_address(Some(0x10000100)).unwrap();
    writer.write_header(&header).unwrap();

    let kernel = b"mtk kernel".repeat(10);
    let ramdisk = b"mtk ramdisk".repeat(10);

    // The sub-headers are streamed with a zero size field; the writer
    // back-patches the real sizes at close.
    let payloads = [
        (
            EntryType::MtkKernelHeader,
            mtk_header_blob(b"KERNEL", 0),
        ),
        (EntryType::Kernel, kernel.clone()),
        (
            EntryType::MtkRamdiskHeader,
            mtk_header_blob(b"ROOTFS", 0),
        ),
        (EntryType::Ramdisk, ramdisk.clone()),
        (EntryType::SecondBoot, vec![]),
        (EntryType::DeviceTree, vec![]),
    ];

    for (ty, data) in &payloads {
        let entry = writer.get_entry().unwrap();
        assert_eq!(entry.entry_type(), *ty);

        writer.write_entry(&Entry::new(*ty)).unwrap();
        writer.write_data(data).unwrap();
        writer.finish_entry().unwrap();
    }

    writer.close().unwrap();

    // The Mtk sub-headers outbid the plain Android reader.
    let mut reader = Reader::new();
    reader.enable_format_all().unwrap();
    reader.open(Box::new(file.reopen().unwrap())).unwrap();
    assert_eq!(reader.format(), Some(FormatCode::Mtk));

    let read_header = reader.read_header().unwrap();
    assert_eq!(read_header, header);

    let mut entries = vec![];
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

        entries.push((entry.entry_type(), data));
    }

    // The sub-headers round-trip with the size field patched in.
    assert_eq!(
        entries,
        vec![
            (
                EntryType::MtkKernelHeader,
                mtk_header_blob(b"KERNEL", kernel.len() as u32),
            ),
            (EntryType::Kernel, kernel),
            (
                EntryType::MtkRamdiskHeader,
                mtk_header_blob(b"ROOTFS", ramdisk.len() as u32),
            ),
            (EntryType::Ramdisk, ramdisk),
        ],
    );
}
