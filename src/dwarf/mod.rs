//! this implements the stuff necessary to get the uwutables for actual unwinding
//!
//! # how it works
//! somebody else (an object file loader) hands us the raw bytes of a
//! `.debug_frame` or `.eh_frame` section. we split that into CIEs and FDEs
//! ([`parse`]), run the call frame instructions of every FDE through a little
//! interpreter ([`machine`], yes, that shit is basically a programming
//! language) and collect the resulting rows into an [`UnwindTable`] that can
//! be asked "how do i unwind out of pc X".
//!
//! See <https://dwarfstd.org/doc/DWARF5.pdf> §6.4 for more information if more
//! information is desired.

pub mod instr;
mod machine;
pub mod parse;
pub mod read;
pub mod table;

#[cfg(test)]
pub(crate) mod testdata;

pub use parse::{parse_section, Augmentation, Cie, Encoding, Fde, FrameSection};
pub use table::{CfaRule, Expression, FdeTable, RegisterRule, RegisterRules, UnwindRow, UnwindTable};

use crate::error::{Error, Result};

/// Byte order of the target the section was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Which flavour of call frame section the bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// `.debug_frame`: CIE id `0xffffffff`, CIE pointers are section offsets.
    DebugFrame,
    /// `.eh_frame`: CIE id `0`, CIE pointers count backwards from the pointer
    /// field itself.
    EhFrame,
}

impl SectionKind {
    /// The section name this kind of data usually lives in.
    pub fn section_name(self) -> &'static str {
        match self {
            SectionKind::DebugFrame => ".debug_frame",
            SectionKind::EhFrame => ".eh_frame",
        }
    }

    fn is_cie_id(self, id: u32) -> bool {
        match self {
            SectionKind::DebugFrame => id == 0xffff_ffff,
            SectionKind::EhFrame => id == 0,
        }
    }

    /// Turns an FDE's CIE pointer into the section offset of the CIE.
    /// `pointer_offset` is the section offset of the CIE pointer field.
    fn resolve_cie_pointer(self, pointer_offset: usize, cie_pointer: u32) -> Option<usize> {
        match self {
            SectionKind::DebugFrame => usize::try_from(cie_pointer).ok(),
            SectionKind::EhFrame => pointer_offset.checked_sub(usize::try_from(cie_pointer).ok()?),
        }
    }
}

/// What the caller knows about the target and the section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub kind: SectionKind,
    /// Size of a target address in bytes, 4 or 8.
    pub address_size: u8,
    pub endian: Endian,
    /// Virtual address the section is loaded at. Only pc-relative `.eh_frame`
    /// pointers depend on it.
    pub section_address: u64,
}

impl ParseOptions {
    pub fn debug_frame(address_size: u8, endian: Endian) -> Self {
        Self {
            kind: SectionKind::DebugFrame,
            address_size,
            endian,
            section_address: 0,
        }
    }

    pub fn eh_frame(address_size: u8, endian: Endian, section_address: u64) -> Self {
        Self {
            kind: SectionKind::EhFrame,
            address_size,
            endian,
            section_address,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.address_size {
            4 | 8 => Ok(()),
            size => Err(Error::UnsupportedAddressSize(size)),
        }
    }
}
