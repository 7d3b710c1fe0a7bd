// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use thiserror::Error;

use crate::{
    format::{android, loki, mtk, segment, sony_elf},
    header,
};

/// Structured error type shared by the reader and writer facades. Each
/// variant is an error category; per-format codes live in the wrapped enums.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Operation is invalid in the current state")]
    InvalidState,
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Unsupported option: {0:?}")]
    UnsupportedFeature(String),
    #[error("Failed to determine boot image format")]
    FormatNotFound,
    #[error("Header field error")]
    Header(#[from] header::Error),
    #[error("Segment error")]
    Segment(#[from] segment::Error),
    #[error("Android format error")]
    Android(#[from] android::Error),
    #[error("Loki format error")]
    Loki(#[from] loki::Error),
    #[error("Mtk format error")]
    Mtk(#[from] mtk::Error),
    #[error("Sony ELF format error")]
    SonyElf(#[from] sony_elf::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this is the reader's end-of-entries signal rather than a
    /// failure.
    pub fn is_end_of_entries(&self) -> bool {
        matches!(self, Self::Segment(segment::Error::EndOfEntries))
    }

    /// Whether the underlying stream failed in a way that poisons the facade.
    /// A clean EOF is a format-level condition, not a stream failure.
    pub fn is_fatal(&self) -> bool {
        let io_err = match self {
            Self::Io(e) => Some(e),
            Self::Segment(segment::Error::Io(e)) => Some(e),
            _ => None,
        };

        io_err.is_some_and(|e| e.kind() != io::ErrorKind::UnexpectedEof)
    }
}
