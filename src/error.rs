use alloc::string::String;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Everything that can go wrong while building or querying an unwind table.
///
/// All variants except [`Error::NoCoverage`] are raised while the table is
/// built and abort the whole build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The input ended in the middle of a field that starts at `offset`.
    #[error("unexpected end of input reading field at offset {offset:#x}")]
    TruncatedInput { offset: usize },
    /// No NUL terminator before the end of the input.
    #[error("string at offset {offset:#x} has no NUL terminator")]
    MalformedString { offset: usize },
    #[error("string at offset {offset:#x} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },
    /// An FDE's CIE pointer does not name the start of a CIE parsed before it.
    #[error("FDE at offset {fde:#x} has CIE pointer {cie_pointer:#x}, which names no known CIE")]
    DanglingFde { fde: usize, cie_pointer: u32 },
    #[error("unknown call frame instruction {0:#04x}")]
    UnknownOpcode(u8),
    #[error("DW_CFA_restore_state without a matching DW_CFA_remember_state")]
    UnbalancedRestore,
    /// No FDE covers the queried program counter.
    #[error("no FDE covers pc {0:#x}")]
    NoCoverage(u64),

    #[error("unsupported CIE version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported augmentation {0:?}")]
    UnsupportedAugmentation(String),
    #[error("unsupported pointer encoding {0:#04x}")]
    UnsupportedPointerEncoding(u8),
    #[error("unsupported address size {0}")]
    UnsupportedAddressSize(u8),
    /// 64-bit DWARF uses `0xffffffff` as a length escape. Not handled.
    #[error("record at offset {offset:#x} uses the 64-bit DWARF format")]
    Dwarf64 { offset: usize },
    #[error("register number {0} is out of range")]
    InvalidRegister(u64),
    #[error("{0} is not allowed in a CIE's initial instructions")]
    InvalidCieInstruction(&'static str),
    #[error("the CFA rule is an expression, not a register and offset")]
    CfaNotRegisterBased,
    #[error("location {new:#x} is before the current location {current:#x}")]
    LocationRegression { current: u64, new: u64 },
    #[error("arithmetic overflow while applying call frame information")]
    Overflow,
    #[error("FDE ranges starting at {first:#x} and {second:#x} overlap")]
    OverlappingFdes { first: u64, second: u64 },
}
