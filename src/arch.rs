//! DWARF register numbers of the architectures we know about.
//!
//! The unwind rows only talk about register *numbers*. What those mean depends
//! on the ABI, these tables give them names for printing.

/// Maps DWARF register numbers to names.
pub trait RegisterNames {
    fn name(&self, register: u16) -> Option<&'static str>;
}

/// Numbers without names.
impl RegisterNames for () {
    fn name(&self, _register: u16) -> Option<&'static str> {
        None
    }
}

/// x86-64 System V psABI numbering.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86_64;

impl X86_64 {
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    /// Not a real register, the column the return address lives in.
    pub const RA: u16 = 16;
}

impl RegisterNames for X86_64 {
    fn name(&self, register: u16) -> Option<&'static str> {
        const NAMES: [&str; 17] = [
            "RAX", "RDX", "RCX", "RBX", "RSI", "RDI", "RBP", "RSP", "R8", "R9", "R10", "R11",
            "R12", "R13", "R14", "R15", "RIP",
        ];
        NAMES.get(usize::from(register)).copied()
    }
}

/// i386 System V numbering.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86;

impl X86 {
    pub const ESP: u16 = 4;
    pub const EBP: u16 = 5;
    pub const RA: u16 = 8;
}

impl RegisterNames for X86 {
    fn name(&self, register: u16) -> Option<&'static str> {
        const NAMES: [&str; 9] = ["EAX", "ECX", "EDX", "EBX", "ESP", "EBP", "ESI", "EDI", "EIP"];
        NAMES.get(usize::from(register)).copied()
    }
}

/// AArch64 DWARF numbering, general purpose registers only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AArch64;

impl AArch64 {
    pub const FP: u16 = 29;
    pub const LR: u16 = 30;
    pub const SP: u16 = 31;
}

impl RegisterNames for AArch64 {
    fn name(&self, register: u16) -> Option<&'static str> {
        const NAMES: [&str; 32] = [
            "W0", "W1", "W2", "W3", "W4", "W5", "W6", "W7", "W8", "W9", "W10", "W11", "W12",
            "W13", "W14", "W15", "W16", "W17", "W18", "W19", "W20", "W21", "W22", "W23", "W24",
            "W25", "W26", "W27", "W28", "W29", "W30", "WSP",
        ];
        NAMES.get(usize::from(register)).copied()
    }
}
