//! Hand assembled sections for the tests.

use alloc::vec::Vec;

use super::read::{write_sleb128, write_uleb128};
use super::{Endian, ParseOptions, SectionKind};

/// A `.debug_frame` for x86-64, 8 byte addresses, little endian.
///
/// ```text
/// 00000000 00000010 ffffffff CIE
///   Version:               3
///   Augmentation:          ""
///   Code alignment factor: 1
///   Data alignment factor: -4
///   Return address column: 16
///
///   DW_CFA_def_cfa: RSP +8
///   DW_CFA_offset: RIP -8
///   DW_CFA_nop:
///   DW_CFA_nop:
///
/// 00000014 00000020 00000000 FDE cie=00000000 pc=00400c00...00400c40
///   DW_CFA_advance_loc: 1
///   DW_CFA_def_cfa_offset: +16
///   DW_CFA_offset: RBP -16
///   DW_CFA_advance_loc: 4
///   DW_CFA_def_cfa_register: RBP
///   DW_CFA_nop: (x4)
///
/// 00000038 00000020 00000000 FDE cie=00000000 pc=00400c40...00400c70
///   DW_CFA_advance_loc: 1
///   DW_CFA_def_cfa_offset: +16
///   DW_CFA_remember_state:
///   DW_CFA_advance_loc: 15
///   DW_CFA_def_cfa_offset: +8
///   DW_CFA_restore: RBP
///   DW_CFA_advance_loc: 1
///   DW_CFA_restore_state:
///   DW_CFA_nop: (x2)
///
/// 0000005c ZERO terminator
/// ```
#[rustfmt::skip]
pub(crate) const DEBUG_FRAME: [u8; 96] = [
    // CIE
    0x10, 0, 0, 0,
    0xff, 0xff, 0xff, 0xff,
    3,
    0,
    1,
    0x7c,
    0x10,
    0x0c, 7, 8,
    0x90, 2,
    0, 0,
    // FDE
    0x20, 0, 0, 0,
    0, 0, 0, 0,
    0x00, 0x0c, 0x40, 0, 0, 0, 0, 0,
    0x40, 0, 0, 0, 0, 0, 0, 0,
    0x41,
    0x0e, 0x10,
    0x86, 0x04,
    0x44,
    0x0d, 0x06,
    0, 0, 0, 0,
    // FDE
    0x20, 0, 0, 0,
    0, 0, 0, 0,
    0x40, 0x0c, 0x40, 0, 0, 0, 0, 0,
    0x30, 0, 0, 0, 0, 0, 0, 0,
    0x41,
    0x0e, 0x10,
    0x0a,
    0x4f,
    0x0e, 0x08,
    0xc6,
    0x41,
    0x0b,
    0, 0,
    // terminator
    0, 0, 0, 0,
];

/// The `.eh_frame` address [`EH_FRAME`] is loaded at.
pub(crate) const EH_FRAME_ADDRESS: u64 = 0x2000;

/// An `.eh_frame` as emitted by rustc for x86-64.
///
/// ```text
/// 00000000 00000014 00000000 CIE
///   Version:               1
///   Augmentation:          "zR"
///   Code alignment factor: 1
///   Data alignment factor: -8
///   Return address column: 16
///   Augmentation data:     1B
///
///   DW_CFA_def_cfa: RSP +8
///   DW_CFA_offset: RIP -8
///   DW_CFA_nop:
///   DW_CFA_nop:
///
/// 00000018 00000014 0000001c FDE cie=00000000 pc=00001000...00001020
///   DW_CFA_advance_loc: 1
///   DW_CFA_def_cfa_offset: +16
///   DW_CFA_offset: RBP -16
///   DW_CFA_nop:
///   DW_CFA_nop:
/// ```
#[rustfmt::skip]
pub(crate) const EH_FRAME: [u8; 52] = [
    // CIE
    0x14, 0, 0, 0,
    0, 0, 0, 0,
    1,
    0x7a, 0x52, 0,
    1,
    0x78,
    0x10,
    1,
    0x1b,
    0xc, 7, 8,
    0x90, 1,
    0, 0,
    // FDE
    0x14, 0, 0, 0,
    0x1c, 0, 0, 0,
    // pcrel sdata4: 0x1000 - (0x2000 + 0x20)
    0xe0, 0xef, 0xff, 0xff,
    0x20, 0, 0, 0,
    0,
    0x41,
    0x0e, 0x10,
    0x86, 0x02,
    0, 0,
    // terminator
    0, 0, 0, 0,
];

/// Assembles sections with version 3 CIEs and no augmentation.
pub(crate) struct SectionBuilder {
    bytes: Vec<u8>,
    options: ParseOptions,
}

impl SectionBuilder {
    pub(crate) fn new(options: ParseOptions) -> Self {
        Self {
            bytes: Vec::new(),
            options,
        }
    }

    pub(crate) fn debug_frame() -> Self {
        Self::new(ParseOptions::debug_frame(8, Endian::Little))
    }

    pub(crate) fn options(&self) -> ParseOptions {
        self.options
    }

    fn u32(&mut self, value: u32) {
        match self.options.endian {
            Endian::Little => self.bytes.extend_from_slice(&value.to_le_bytes()),
            Endian::Big => self.bytes.extend_from_slice(&value.to_be_bytes()),
        }
    }

    fn address(&mut self, value: u64) {
        match (self.options.address_size, self.options.endian) {
            (4, Endian::Little) => self.bytes.extend_from_slice(&(value as u32).to_le_bytes()),
            (4, Endian::Big) => self.bytes.extend_from_slice(&(value as u32).to_be_bytes()),
            (_, Endian::Little) => self.bytes.extend_from_slice(&value.to_le_bytes()),
            (_, Endian::Big) => self.bytes.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Writes the length and returns the record's offset.
    fn record(&mut self, body: impl FnOnce(&mut Self)) -> usize {
        let offset = self.bytes.len();
        self.u32(0);
        body(self);
        let length = (self.bytes.len() - offset - 4) as u32;
        let length = match self.options.endian {
            Endian::Little => length.to_le_bytes(),
            Endian::Big => length.to_be_bytes(),
        };
        self.bytes[offset..offset + 4].copy_from_slice(&length);
        offset
    }

    /// Adds a CIE and returns its offset.
    pub(crate) fn cie(
        &mut self,
        code_alignment_factor: u64,
        data_alignment_factor: i64,
        return_address_register: u64,
        instructions: &[u8],
    ) -> usize {
        self.record(|b| {
            match b.options.kind {
                SectionKind::DebugFrame => b.u32(0xffff_ffff),
                SectionKind::EhFrame => b.u32(0),
            }
            b.bytes.push(3);
            b.bytes.push(0);
            write_uleb128(&mut b.bytes, code_alignment_factor);
            write_sleb128(&mut b.bytes, data_alignment_factor);
            write_uleb128(&mut b.bytes, return_address_register);
            b.bytes.extend_from_slice(instructions);
        })
    }

    /// Adds an FDE belonging to the CIE at `cie` and returns its offset.
    pub(crate) fn fde(
        &mut self,
        cie: usize,
        initial_location: u64,
        address_range: u64,
        instructions: &[u8],
    ) -> usize {
        self.record(|b| {
            let pointer = match b.options.kind {
                SectionKind::DebugFrame => cie as u32,
                SectionKind::EhFrame => (b.bytes.len() - cie) as u32,
            };
            b.u32(pointer);
            b.address(initial_location);
            b.address(address_range);
            b.bytes.extend_from_slice(instructions);
        })
    }

    /// The section so far, with a terminator.
    pub(crate) fn finish(&self) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        bytes.extend_from_slice(&[0; 4]);
        bytes
    }
}
