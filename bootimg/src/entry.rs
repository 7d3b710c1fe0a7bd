// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

/// Type of a payload segment within a boot image. Which types appear, and in
/// which order, depends on the container format.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum EntryType {
    Kernel,
    Ramdisk,
    SecondBoot,
    DeviceTree,
    MtkKernelHeader,
    MtkRamdiskHeader,
    SonyIpl,
    SonyRpm,
    SonyAppsbl,
}

impl EntryType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::Ramdisk => "ramdisk",
            Self::SecondBoot => "secondboot",
            Self::DeviceTree => "device_tree",
            Self::MtkKernelHeader => "mtk_kernel_header",
            Self::MtkRamdiskHeader => "mtk_ramdisk_header",
            Self::SonyIpl => "sony_ipl",
            Self::SonyRpm => "sony_rpm",
            Self::SonyAppsbl => "sony_appsbl",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Caller-visible descriptor of one payload segment. Entries carry no data;
/// segment data flows through `read_data`/`write_data`.
///
/// On the read side, the size is always known. On the write side, the size is
/// an optional pre-declaration: when present, the number of bytes actually
/// streamed must match it exactly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    ty: EntryType,
    size: Option<u64>,
}

impl Entry {
    pub fn new(ty: EntryType) -> Self {
        Self { ty, size: None }
    }

    pub fn with_size(ty: EntryType, size: u64) -> Self {
        Self {
            ty,
            size: Some(size),
        }
    }

    pub fn entry_type(&self) -> EntryType {
        self.ty
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn set_size(&mut self, size: Option<u64>) {
        self.size = size;
    }
}
