//! Unwind tables from DWARF call frame information.
//!
//! Hand [`UnwindTable::parse`] the bytes of a `.debug_frame` or `.eh_frame`
//! section and ask it how to unwind out of a pc:
//!
//! ```
//! use uwutables::{Endian, ParseOptions, UnwindTable};
//!
//! let section = [0, 0, 0, 0];
//! let table = UnwindTable::parse(&section, ParseOptions::debug_frame(8, Endian::Little)).unwrap();
//! assert!(table.resolve(0x1000).is_err());
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

mod error;

pub mod arch;
pub mod dwarf;

pub use dwarf::{
    parse_section, CfaRule, Endian, FdeTable, FrameSection, ParseOptions, RegisterRule,
    SectionKind, UnwindRow, UnwindTable,
};
pub use error::{Error, Result};
