//! Call frame instructions.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.2 Call Frame Instructions
//!
//! Each instruction starts with one byte. If its high two bits are set, they
//! are the opcode and the low six bits are an operand ("packed" opcodes).
//! Otherwise the whole byte is the opcode and the operands follow it.
#![allow(non_upper_case_globals)]

use super::parse::{read_encoded, Encoding};
use super::read::Reader;
use super::table::Expression;
use super::Endian;
use crate::error::{Error, Result};

pub(crate) const DW_CFA_advance_loc_hi: u8 = 0x01;
pub(crate) const DW_CFA_offset_hi: u8 = 0x02;
pub(crate) const DW_CFA_restore_hi: u8 = 0x03;

pub(crate) const DW_CFA_nop: u8 = 0;
pub(crate) const DW_CFA_set_loc: u8 = 0x01;
pub(crate) const DW_CFA_advance_loc1: u8 = 0x02;
pub(crate) const DW_CFA_advance_loc2: u8 = 0x03;
pub(crate) const DW_CFA_advance_loc4: u8 = 0x04;
pub(crate) const DW_CFA_offset_extended: u8 = 0x05;
pub(crate) const DW_CFA_restore_extended: u8 = 0x06;
pub(crate) const DW_CFA_undefined: u8 = 0x07;
pub(crate) const DW_CFA_same_value: u8 = 0x08;
pub(crate) const DW_CFA_register: u8 = 0x09;
pub(crate) const DW_CFA_remember_state: u8 = 0x0a;
pub(crate) const DW_CFA_restore_state: u8 = 0x0b;
pub(crate) const DW_CFA_def_cfa: u8 = 0x0c;
pub(crate) const DW_CFA_def_cfa_register: u8 = 0x0d;
pub(crate) const DW_CFA_def_cfa_offset: u8 = 0x0e;
pub(crate) const DW_CFA_def_cfa_expression: u8 = 0x0f;
pub(crate) const DW_CFA_expression: u8 = 0x10;
pub(crate) const DW_CFA_offset_extended_sf: u8 = 0x11;
pub(crate) const DW_CFA_def_cfa_sf: u8 = 0x12;
pub(crate) const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
pub(crate) const DW_CFA_val_offset: u8 = 0x14;
pub(crate) const DW_CFA_val_offset_sf: u8 = 0x15;
pub(crate) const DW_CFA_val_expression: u8 = 0x16;
pub(crate) const DW_CFA_GNU_args_size: u8 = 0x2e;

/// The first byte of an instruction, split by encoding class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    /// High two bits select the operation, the low six bits are its operand.
    Packed { high: u8, operand: u8 },
    /// The whole byte selects the operation.
    Extended(u8),
}

impl Opcode {
    fn from_byte(b: u8) -> Self {
        match b >> 6 {
            0 => Opcode::Extended(b),
            high => Opcode::Packed {
                high,
                operand: b & (u8::MAX >> 2),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<'a> {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// Create a new row at the given address.
    SetLoc(u64),
    /// Create a new row `delta * code_alignment_factor` bytes further on.
    /// Covers `DW_CFA_advance_loc` and its 1, 2 and 4 byte forms.
    AdvanceLoc { delta: u32 },
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    /// CFA is `register + offset`, the offset is not factored.
    DefCfa { register: u16, offset: u64 },
    /// Like `DefCfa`, but the offset is signed and factored.
    DefCfaSf { register: u16, factored_offset: i64 },
    /// Change the CFA register, keep the offset.
    DefCfaRegister(u16),
    /// Change the CFA offset, keep the register.
    DefCfaOffset(u64),
    DefCfaOffsetSf(i64),
    DefCfaExpression(Expression<'a>),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    Undefined(u16),
    SameValue(u16),
    /// The register is saved at `CFA + factored_offset * data_alignment_factor`.
    /// Covers `DW_CFA_offset` and `DW_CFA_offset_extended`.
    Offset { register: u16, factored_offset: u64 },
    OffsetExtendedSf { register: u16, factored_offset: i64 },
    /// The register's value is `CFA + factored_offset * data_alignment_factor`.
    ValOffset { register: u16, factored_offset: u64 },
    ValOffsetSf { register: u16, factored_offset: i64 },
    /// `register` is saved in `from`.
    Register { register: u16, from: u16 },
    Expression { register: u16, expr: Expression<'a> },
    ValExpression { register: u16, expr: Expression<'a> },
    /// Reset the register to the rule the CIE's initial instructions gave it.
    /// Covers `DW_CFA_restore` and `DW_CFA_restore_extended`.
    Restore(u16),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    RememberState,
    RestoreState,
    //
    //-------- vendor extensions
    //
    /// Size of the arguments pushed on the stack. Has no effect on the rules.
    GnuArgsSize(u64),
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    Nop,
}

impl Instruction<'_> {
    /// The DWARF name of the instruction, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::SetLoc(_) => "DW_CFA_set_loc",
            Instruction::AdvanceLoc { .. } => "DW_CFA_advance_loc",
            Instruction::DefCfa { .. } => "DW_CFA_def_cfa",
            Instruction::DefCfaSf { .. } => "DW_CFA_def_cfa_sf",
            Instruction::DefCfaRegister(_) => "DW_CFA_def_cfa_register",
            Instruction::DefCfaOffset(_) => "DW_CFA_def_cfa_offset",
            Instruction::DefCfaOffsetSf(_) => "DW_CFA_def_cfa_offset_sf",
            Instruction::DefCfaExpression(_) => "DW_CFA_def_cfa_expression",
            Instruction::Undefined(_) => "DW_CFA_undefined",
            Instruction::SameValue(_) => "DW_CFA_same_value",
            Instruction::Offset { .. } => "DW_CFA_offset",
            Instruction::OffsetExtendedSf { .. } => "DW_CFA_offset_extended_sf",
            Instruction::ValOffset { .. } => "DW_CFA_val_offset",
            Instruction::ValOffsetSf { .. } => "DW_CFA_val_offset_sf",
            Instruction::Register { .. } => "DW_CFA_register",
            Instruction::Expression { .. } => "DW_CFA_expression",
            Instruction::ValExpression { .. } => "DW_CFA_val_expression",
            Instruction::Restore(_) => "DW_CFA_restore",
            Instruction::RememberState => "DW_CFA_remember_state",
            Instruction::RestoreState => "DW_CFA_restore_state",
            Instruction::GnuArgsSize(_) => "DW_CFA_GNU_args_size",
            Instruction::Nop => "DW_CFA_nop",
        }
    }
}

/// What decoding needs to know about the CIE the instructions belong to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InstrContext {
    pub(crate) address_size: u8,
    pub(crate) segment_selector_size: u8,
    /// `.eh_frame` `R` augmentation; `DW_CFA_set_loc` operands use it.
    pub(crate) pointer_encoding: Option<Encoding>,
    pub(crate) section_address: u64,
}

/// Decodes an instruction stream. Stops after the first error.
#[derive(Debug, Clone)]
pub struct InstrIter<'a> {
    reader: Reader<'a>,
    ctx: InstrContext,
    failed: bool,
}

impl<'a> InstrIter<'a> {
    /// `data` starts at section offset `offset`.
    pub(crate) fn new(data: &'a [u8], offset: usize, ctx: InstrContext, endian: Endian) -> Self {
        Self {
            reader: Reader::at(data, offset, endian),
            ctx,
            failed: false,
        }
    }

    /// Section offset of the next instruction.
    pub fn offset(&self) -> usize {
        self.reader.offset()
    }

    fn register(&mut self) -> Result<u16> {
        let value = self.reader.uleb128()?;
        u16::try_from(value).map_err(|_| Error::InvalidRegister(value))
    }

    fn expression(&mut self) -> Result<Expression<'a>> {
        let len = self.reader.uleb128()?;
        let len = usize::try_from(len).map_err(|_| Error::Overflow)?;
        Ok(Expression(self.reader.bytes(len)?))
    }

    fn address(&mut self) -> Result<u64> {
        self.reader.bytes(usize::from(self.ctx.segment_selector_size))?;
        match self.ctx.pointer_encoding {
            Some(encoding) => read_encoded(
                &mut self.reader,
                encoding,
                self.ctx.address_size,
                self.ctx.section_address,
            ),
            None => self.reader.address(self.ctx.address_size),
        }
    }

    fn decode(&mut self) -> Result<Instruction<'a>> {
        let b = self.reader.u8()?;
        Ok(match Opcode::from_byte(b) {
            Opcode::Packed { high, operand } => match high {
                DW_CFA_advance_loc_hi => Instruction::AdvanceLoc {
                    delta: u32::from(operand),
                },
                DW_CFA_offset_hi => Instruction::Offset {
                    register: u16::from(operand),
                    factored_offset: self.reader.uleb128()?,
                },
                DW_CFA_restore_hi => Instruction::Restore(u16::from(operand)),
                _ => unreachable!("two bits hold at most 3"),
            },
            Opcode::Extended(op) => match op {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => Instruction::SetLoc(self.address()?),
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc {
                    delta: u32::from(self.reader.u8()?),
                },
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc {
                    delta: u32::from(self.reader.u16()?),
                },
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc {
                    delta: self.reader.u32()?,
                },
                DW_CFA_offset_extended => Instruction::Offset {
                    register: self.register()?,
                    factored_offset: self.reader.uleb128()?,
                },
                DW_CFA_restore_extended => Instruction::Restore(self.register()?),
                DW_CFA_undefined => Instruction::Undefined(self.register()?),
                DW_CFA_same_value => Instruction::SameValue(self.register()?),
                DW_CFA_register => Instruction::Register {
                    register: self.register()?,
                    from: self.register()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: self.register()?,
                    offset: self.reader.uleb128()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(self.register()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(self.reader.uleb128()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.expression()?),
                DW_CFA_expression => Instruction::Expression {
                    register: self.register()?,
                    expr: self.expression()?,
                },
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register: self.register()?,
                    factored_offset: self.reader.sleb128()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: self.register()?,
                    factored_offset: self.reader.sleb128()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(self.reader.sleb128()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: self.register()?,
                    factored_offset: self.reader.uleb128()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: self.register()?,
                    factored_offset: self.reader.sleb128()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: self.register()?,
                    expr: self.expression()?,
                },
                DW_CFA_GNU_args_size => Instruction::GnuArgsSize(self.reader.uleb128()?),
                // skipping would read the operands of the unknown instruction
                // as instructions
                _ => return Err(Error::UnknownOpcode(op)),
            },
        })
    }
}

impl<'a> Iterator for InstrIter<'a> {
    type Item = Result<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }
        let result = self.decode();
        self.failed = result.is_err();
        Some(result)
    }
}

impl core::iter::FusedIterator for InstrIter<'_> {}
