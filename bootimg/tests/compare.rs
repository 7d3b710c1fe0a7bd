/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::{Path, PathBuf};

use bootimg::{
    cli::compare::compare_files,
    entry::{Entry, EntryType},
    header::Header,
    writer::Writer,
};

fn write_android_image(
    path: &Path,
    kernel_addr: u32,
    kernel: &[u8],
    ramdisk: &[u8],
) -> Header {
    let mut writer = Writer::new();
    writer.set_format_android().unwrap();
    writer.open_filename(path).unwrap();

    let mut header = writer.get_header().unwrap();
    header.set_page_size(Some(2048)).unwrap();
    header.set_kernel_address(Some(kernel_addr)).unwrap();
    header.set_ramdisk_address(Some(0x11000000)).unwrap();
    header.set_secondboot_address(Some(0x12000000)).unwrap();
    header.set_kernel_tags_address(Some(0x10000100)).unwrap();
    writer.write_header(&header).unwrap();

    let payloads = [
        (EntryType::Kernel, kernel),
        (EntryType::Ramdisk, ramdisk),
        (EntryType::SecondBoot, b"".as_slice()),
        (EntryType::DeviceTree, b"".as_slice()),
    ];

    for (ty, data) in payloads {
        writer.get_entry().unwrap();
        writer.write_entry(&Entry::new(ty)).unwrap();
        writer.write_data(data).unwrap();
        writer.finish_entry().unwrap();
    }

    writer.close().unwrap();

    header
}

fn temp_paths(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
    (dir.path().join("a.img"), dir.path().join("b.img"))
}

#[test]
fn equal_images() {
    let dir = tempfile::tempdir().unwrap();
    let (path_a, path_b) = temp_paths(&dir);

    write_android_image(&path_a, 0x8000, b"KERN", b"RAMD");
    write_android_image(&path_b, 0x8000, b"KERN", b"RAMD");

    assert!(compare_files(&path_a, &path_b).unwrap());
}

#[test]
fn differing_header() {
    let dir = tempfile::tempdir().unwrap();
    let (path_a, path_b) = temp_paths(&dir);

    write_android_image(&path_a, 0x8000, b"KERN", b"RAMD");
    write_android_image(&path_b, 0x10000000, b"KERN", b"RAMD");

    assert!(!compare_files(&path_a, &path_b).unwrap());
}

#[test]
fn differing_data() {
    let dir = tempfile::tempdir().unwrap();
    let (path_a, path_b) = temp_paths(&dir);

    write_android_image(&path_a, 0x8000, b"KERNA", b"RAMD");
    write_android_image(&path_b, 0x8000, b"KERNB", b"RAMD");

    assert!(!compare_files(&path_a, &path_b).unwrap());
}

#[test]
fn differing_entry_counts() {
    let dir = tempfile::tempdir().unwrap();
    let (path_a, path_b) = temp_paths(&dir);

    write_android_image(&path_a, 0x8000, b"KERN", b"RAMD");

    // Same header, but no kernel segment at all in the second image.
    write_android_image(&path_b, 0x8000, b"", b"RAMD");

    assert!(!compare_files(&path_a, &path_b).unwrap());
    assert!(!compare_files(&path_b, &path_a).unwrap());
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (path_a, path_b) = temp_paths(&dir);

    write_android_image(&path_a, 0x8000, b"KERN", b"RAMD");

    assert!(compare_files(&path_a, &path_b).is_err());
}
