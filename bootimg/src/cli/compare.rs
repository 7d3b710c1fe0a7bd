// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::reader::Reader;

const CHUNK_SIZE: usize = 10240;

fn open_reader(path: &Path) -> Result<Reader> {
    let mut reader = Reader::new();

    reader
        .enable_format_all()
        .context("Failed to enable all boot image formats")?;
    reader
        .open_filename(path)
        .with_context(|| format!("Failed to open boot image for reading: {path:?}"))?;

    Ok(reader)
}

/// Compare two boot images through the reader facade. Returns true if the
/// headers and all entry data are equal.
pub fn compare_files(path1: &Path, path2: &Path) -> Result<bool> {
    let mut reader1 = open_reader(path1)?;
    let mut reader2 = open_reader(path2)?;

    let header1 = reader1
        .read_header()
        .with_context(|| format!("{path1:?}: Failed to read header"))?;
    let header2 = reader2
        .read_header()
        .with_context(|| format!("{path2:?}: Failed to read header"))?;

    if header1 != header2 {
        return Ok(false);
    }

    // Count the entries in the first image.
    let mut entries = 0usize;
    loop {
        match reader1.read_entry() {
            Ok(_) => entries += 1,
            Err(e) if e.is_end_of_entries() => break,
            Err(e) => {
                return Err(e).with_context(|| format!("{path1:?}: Failed to read entry"));
            }
        }
    }

    // Pair each entry in the second image with the entry of the same type in
    // the first and compare the data byte for byte.
    loop {
        let entry2 = match reader2.read_entry() {
            Ok(entry) => entry,
            Err(e) if e.is_end_of_entries() => break,
            Err(e) => {
                return Err(e).with_context(|| format!("{path2:?}: Failed to read entry"));
            }
        };

        if entries == 0 {
            // Too many entries in the second image.
            return Ok(false);
        }
        entries -= 1;

        let entry1 = match reader1.go_to_entry(entry2.entry_type()) {
            Ok(entry) => entry,
            Err(e) if e.is_end_of_entries() => {
                // Cannot be equal if the entry is missing.
                return Ok(false);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("{path1:?}: Failed to seek to entry"));
            }
        };

        if entry1.size() != entry2.size() {
            return Ok(false);
        }

        let mut buf1 = [0u8; CHUNK_SIZE];
        let mut buf2 = [0u8; CHUNK_SIZE];

        loop {
            let n1 = reader1
                .read_data(&mut buf1)
                .with_context(|| format!("{path1:?}: Failed to read data"))?;
            if n1 == 0 {
                break;
            }

            let n2 = reader2
                .read_data(&mut buf2[..n1])
                .with_context(|| format!("{path2:?}: Failed to read data"))?;

            if n1 != n2 || buf1[..n1] != buf2[..n2] {
                return Ok(false);
            }
        }
    }

    // Too few entries in the second image.
    if entries != 0 {
        return Ok(false);
    }

    Ok(true)
}

/// Compare two boot images.
///
/// Exits with 0 if the images are equal, 1 if an error occurs, and 2 if the
/// images are not equal.
#[derive(Debug, Parser)]
#[command(name = "bootimg_compare", version)]
pub struct CompareCli {
    /// Path to first boot image.
    #[arg(value_name = "FILE1", value_parser)]
    pub file1: PathBuf,

    /// Path to second boot image.
    #[arg(value_name = "FILE2", value_parser)]
    pub file2: PathBuf,
}
