/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod android;
pub mod loki;
pub mod mtk;
pub mod padding;
pub mod segment;
pub mod sony_elf;

use std::fmt;

use crate::{
    entry::{Entry, EntryType},
    error::Result,
    header::Header,
    stream::{ReadSeek, ReadWriteSeek},
};

/// Identifies one of the supported boot image container formats.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum FormatCode {
    Android,
    Bump,
    Loki,
    Mtk,
    SonyElf,
}

impl FormatCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Bump => "bump",
            Self::Loki => "loki",
            Self::Mtk => "mtk",
            Self::SonyElf => "sony_elf",
        }
    }

    /// Stable numeric code exposed through the facades.
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Android => 0x01,
            Self::Bump => 0x02,
            Self::Loki => 0x04,
            Self::Mtk => 0x08,
            Self::SonyElf => 0x10,
        }
    }
}

impl fmt::Display for FormatCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a format's bid on an input file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bid {
    /// The format's maximum achievable score cannot beat `best_bid`, so the
    /// file was not inspected.
    Unwinnable,
    /// Number of bits of magic-sequence evidence found. 0 means the file is
    /// definitely not in this format.
    Score(i32),
}

/// One registered reader-side format. Bidding and header parsing are
/// format-specific; entry iteration and data reads delegate to the segment
/// engine once `read_header` has populated the segment list.
pub(crate) trait FormatReader {
    fn format(&self) -> FormatCode;

    fn set_option(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    fn bid(&mut self, file: &mut dyn ReadSeek, best_bid: i32) -> Result<Bid>;

    fn read_header(&mut self, file: &mut dyn ReadSeek) -> Result<Header>;

    fn read_entry(&mut self, file: &mut dyn ReadSeek) -> Result<Entry>;

    fn go_to_entry(&mut self, file: &mut dyn ReadSeek, ty: EntryType) -> Result<Entry>;

    fn read_data(&mut self, file: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize>;
}

/// One registered writer-side format. The caller supplies a header, then
/// drives each expected entry in order; `close` finalizes the image by
/// back-patching headers and trailers.
pub(crate) trait FormatWriter {
    fn format(&self) -> FormatCode;

    fn set_option(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    fn get_header(&self) -> Header;

    fn write_header(&mut self, file: &mut dyn ReadWriteSeek, header: &Header) -> Result<()>;

    fn get_entry(&mut self, file: &mut dyn ReadWriteSeek) -> Result<Entry>;

    fn write_entry(&mut self, file: &mut dyn ReadWriteSeek, entry: &Entry) -> Result<()>;

    fn write_data(&mut self, file: &mut dyn ReadWriteSeek, buf: &[u8]) -> Result<usize>;

    fn finish_entry(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()>;

    fn close(&mut self, file: &mut dyn ReadWriteSeek) -> Result<()>;
}
