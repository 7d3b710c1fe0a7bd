/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Reading and writing of Android-ecosystem boot images: the stock Android
//! container plus the Bump, Loki, Mtk, and Sony ELF variants. The reader
//! probes every enabled format and picks the best match; the writer emits a
//! valid file for the configured format.

pub mod cli;
pub mod entry;
pub mod error;
pub mod format;
pub mod header;
pub mod reader;
pub mod stream;
pub mod writer;
