// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use bitflags::bitflags;
use thiserror::Error;

/// Maximum board name length, including the NULL terminator.
pub const BOARD_NAME_SIZE: usize = 16;
/// Maximum kernel command line length, including the NULL terminator.
pub const KERNEL_CMDLINE_SIZE: usize = 512;

bitflags! {
    /// Set of metadata fields a boot image format can represent.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HeaderFields: u32 {
        const BOARD_NAME = 1 << 0;
        const KERNEL_CMDLINE = 1 << 1;
        const PAGE_SIZE = 1 << 2;
        const KERNEL_ADDRESS = 1 << 3;
        const RAMDISK_ADDRESS = 1 << 4;
        const SECONDBOOT_ADDRESS = 1 << 5;
        const KERNEL_TAGS_ADDRESS = 1 << 6;
        const ENTRYPOINT_ADDRESS = 1 << 7;
        const SONY_IPL_ADDRESS = 1 << 8;
        const SONY_RPM_ADDRESS = 1 << 9;
        const SONY_APPSBL_ADDRESS = 1 << 10;
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} field is not supported by the current format")]
    FieldUnsupported(&'static str),
    #[error("{0:?} field is too long: {1} bytes (max: {2})")]
    TooLong(&'static str, usize, usize),
}

type Result<T> = std::result::Result<T, Error>;

/// Uniform in-memory representation of a boot image's metadata. Every field
/// is optional; each format populates the subset it supports and declares
/// that subset via [`Header::supported_fields`].
#[derive(Clone, Debug, Default)]
pub struct Header {
    supported: HeaderFields,
    board_name: Option<String>,
    kernel_cmdline: Option<String>,
    page_size: Option<u32>,
    kernel_address: Option<u32>,
    ramdisk_address: Option<u32>,
    secondboot_address: Option<u32>,
    kernel_tags_address: Option<u32>,
    entrypoint_address: Option<u32>,
    sony_ipl_address: Option<u32>,
    sony_rpm_address: Option<u32>,
    sony_appsbl_address: Option<u32>,
}

macro_rules! address_field {
    ($getter:ident, $setter:ident, $flag:ident) => {
        pub fn $getter(&self) -> Option<u32> {
            self.$getter
        }

        pub fn $setter(&mut self, address: Option<u32>) -> Result<()> {
            self.check(HeaderFields::$flag, stringify!($getter))?;
            self.$getter = address;
            Ok(())
        }
    };
}

impl Header {
    /// A standalone header supports every field. Headers obtained from a
    /// reader or writer have the mask narrowed to the format's subset.
    pub fn new() -> Self {
        Self {
            supported: HeaderFields::all(),
            ..Default::default()
        }
    }

    pub fn supported_fields(&self) -> HeaderFields {
        self.supported
    }

    pub(crate) fn set_supported_fields(&mut self, fields: HeaderFields) {
        self.supported = fields;
    }

    fn check(&self, field: HeaderFields, name: &'static str) -> Result<()> {
        if !self.supported.contains(field) {
            return Err(Error::FieldUnsupported(name));
        }
        Ok(())
    }

    pub fn board_name(&self) -> Option<&str> {
        self.board_name.as_deref()
    }

    pub fn set_board_name(&mut self, name: Option<String>) -> Result<()> {
        self.check(HeaderFields::BOARD_NAME, "board_name")?;

        if let Some(name) = &name {
            if name.len() >= BOARD_NAME_SIZE {
                return Err(Error::TooLong("board_name", name.len(), BOARD_NAME_SIZE - 1));
            }
        }

        self.board_name = name;
        Ok(())
    }

    pub fn kernel_cmdline(&self) -> Option<&str> {
        self.kernel_cmdline.as_deref()
    }

    pub fn set_kernel_cmdline(&mut self, cmdline: Option<String>) -> Result<()> {
        self.check(HeaderFields::KERNEL_CMDLINE, "kernel_cmdline")?;

        if let Some(cmdline) = &cmdline {
            if cmdline.len() >= KERNEL_CMDLINE_SIZE {
                return Err(Error::TooLong(
                    "kernel_cmdline",
                    cmdline.len(),
                    KERNEL_CMDLINE_SIZE - 1,
                ));
            }
        }

        self.kernel_cmdline = cmdline;
        Ok(())
    }

    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    pub fn set_page_size(&mut self, page_size: Option<u32>) -> Result<()> {
        self.check(HeaderFields::PAGE_SIZE, "page_size")?;
        self.page_size = page_size;
        Ok(())
    }

    address_field!(kernel_address, set_kernel_address, KERNEL_ADDRESS);
    address_field!(ramdisk_address, set_ramdisk_address, RAMDISK_ADDRESS);
    address_field!(secondboot_address, set_secondboot_address, SECONDBOOT_ADDRESS);
    address_field!(
        kernel_tags_address,
        set_kernel_tags_address,
        KERNEL_TAGS_ADDRESS
    );
    address_field!(entrypoint_address, set_entrypoint_address, ENTRYPOINT_ADDRESS);
    address_field!(sony_ipl_address, set_sony_ipl_address, SONY_IPL_ADDRESS);
    address_field!(sony_rpm_address, set_sony_rpm_address, SONY_RPM_ADDRESS);
    address_field!(sony_appsbl_address, set_sony_appsbl_address, SONY_APPSBL_ADDRESS);
}

/// Equality is field-wise over the intersection of the two supported-field
/// sets. Fields outside the intersection are ignored.
impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        let common = self.supported & other.supported;

        macro_rules! field_eq {
            ($flag:ident, $field:ident) => {
                !common.contains(HeaderFields::$flag) || self.$field == other.$field
            };
        }

        field_eq!(BOARD_NAME, board_name)
            && field_eq!(KERNEL_CMDLINE, kernel_cmdline)
            && field_eq!(PAGE_SIZE, page_size)
            && field_eq!(KERNEL_ADDRESS, kernel_address)
            && field_eq!(RAMDISK_ADDRESS, ramdisk_address)
            && field_eq!(SECONDBOOT_ADDRESS, secondboot_address)
            && field_eq!(KERNEL_TAGS_ADDRESS, kernel_tags_address)
            && field_eq!(ENTRYPOINT_ADDRESS, entrypoint_address)
            && field_eq!(SONY_IPL_ADDRESS, sony_ipl_address)
            && field_eq!(SONY_RPM_ADDRESS, sony_rpm_address)
            && field_eq!(SONY_APPSBL_ADDRESS, sony_appsbl_address)
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, HeaderFields};

    #[test]
    fn unsupported_field_rejected() {
        let mut header = Header::new();
        header.set_supported_fields(HeaderFields::KERNEL_ADDRESS);

        header.set_kernel_address(Some(0x8000)).unwrap();
        header.set_ramdisk_address(Some(0x1000000)).unwrap_err();
    }

    #[test]
    fn bounded_strings() {
        let mut header = Header::new();

        header.set_board_name(Some("a".repeat(15))).unwrap();
        header.set_board_name(Some("a".repeat(16))).unwrap_err();

        header.set_kernel_cmdline(Some("c".repeat(511))).unwrap();
        header.set_kernel_cmdline(Some("c".repeat(512))).unwrap_err();

        // Clearing is always allowed.
        header.set_board_name(None).unwrap();
        assert_eq!(header.board_name(), None);
    }

    #[test]
    fn equality_over_intersection() {
        let mut a = Header::new();
        a.set_supported_fields(HeaderFields::KERNEL_ADDRESS | HeaderFields::PAGE_SIZE);
        a.set_kernel_address(Some(0x8000)).unwrap();
        a.set_page_size(Some(2048)).unwrap();

        let mut b = Header::new();
        b.set_supported_fields(HeaderFields::KERNEL_ADDRESS | HeaderFields::RAMDISK_ADDRESS);
        b.set_kernel_address(Some(0x8000)).unwrap();
        b.set_ramdisk_address(Some(0x1000000)).unwrap();

        // page_size and ramdisk_address are outside the intersection.
        assert_eq!(a, b);

        b.set_kernel_address(Some(0x10000000)).unwrap();
        assert_ne!(a, b);
    }
}
