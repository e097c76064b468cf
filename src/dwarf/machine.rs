//! # the machine
//!
//! the call frame instructions are a tiny programming language. the program
//! of an FDE is "the CIE's initial instructions, then the FDE's
//! instructions", and running it prints out the rows of the unwind table.
//!
//! the machine state is the location counter, the CFA rule, the register
//! rules and a stack of remembered (CFA rule, register rules) pairs. the CIE
//! part is run once per CIE; its end state is the initial row that every FDE
//! of that CIE starts from and that `DW_CFA_restore` goes back to.

use alloc::vec::Vec;

use super::instr::Instruction;
use super::parse::{Cie, Fde};
use super::table::{CfaRule, FdeTable, RegisterRule, RegisterRules, UnwindRow};
use super::ParseOptions;
use crate::error::{Error, Result};

/// The rules of one row, without its location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RowState<'a> {
    pub(crate) cfa: CfaRule<'a>,
    pub(crate) registers: RegisterRules<'a>,
}

struct Machine<'a, 'i> {
    code_alignment_factor: u64,
    data_alignment_factor: i64,
    /// What the CIE's initial instructions left behind. `None` while they are
    /// still running.
    initial: Option<&'i RowState<'a>>,
    loc: u64,
    end: u64,
    state: RowState<'a>,
    stack: Vec<RowState<'a>>,
    rows: Vec<UnwindRow<'a>>,
}

/// Runs a CIE's initial instructions.
#[instrument(level = "debug", skip_all, fields(cie = cie.offset))]
pub(crate) fn initial_state<'a>(cie: &Cie<'a>, options: &ParseOptions) -> Result<RowState<'a>> {
    let mut machine = Machine {
        code_alignment_factor: cie.code_alignment_factor,
        data_alignment_factor: cie.data_alignment_factor,
        initial: None,
        loc: 0,
        end: 0,
        state: RowState::default(),
        stack: Vec::new(),
        rows: Vec::new(),
    };
    for instruction in cie.initial_instruction_iter(options) {
        machine.execute(instruction?)?;
    }
    trace!(state = ?machine.state, "initial row");
    Ok(machine.state)
}

/// Runs an FDE's instructions on top of `initial` and collects its rows.
#[instrument(level = "debug", skip_all, fields(fde = fde.offset))]
pub(crate) fn fde_table<'a>(
    cie: &Cie<'a>,
    initial: &RowState<'a>,
    fde: &Fde<'a>,
    options: &ParseOptions,
) -> Result<FdeTable<'a>> {
    let end = fde.end().ok_or(Error::Overflow)?;
    let mut machine = Machine {
        code_alignment_factor: cie.code_alignment_factor,
        data_alignment_factor: cie.data_alignment_factor,
        initial: Some(initial),
        loc: fde.initial_location,
        end,
        state: initial.clone(),
        stack: Vec::new(),
        rows: Vec::new(),
    };
    for instruction in fde.instruction_iter(cie, options) {
        machine.execute(instruction?)?;
    }
    // the last row runs until the end of the function
    machine.emit(end);

    trace!(rows = machine.rows.len(), "FDE [{:#x}, {end:#x})", fde.initial_location);
    Ok(FdeTable {
        fde_offset: fde.offset,
        cie_offset: cie.offset,
        start: fde.initial_location,
        end,
        return_address_register: cie.return_address_register,
        rows: machine.rows,
    })
}

impl<'a> Machine<'a, '_> {
    fn fde_only(&self, instruction: &Instruction<'_>) -> Result<()> {
        match self.initial {
            Some(_) => Ok(()),
            None => Err(Error::InvalidCieInstruction(instruction.name())),
        }
    }

    /// Closes the current row at `new_loc` and moves the location counter
    /// there.
    fn advance_to(&mut self, new_loc: u64) -> Result<()> {
        if new_loc < self.loc {
            return Err(Error::LocationRegression {
                current: self.loc,
                new: new_loc,
            });
        }
        self.emit(new_loc);
        self.loc = new_loc;
        Ok(())
    }

    /// Pushes the current state as a row covering `[loc, until)`, clipped to
    /// the end of the FDE. Empty rows are not pushed.
    fn emit(&mut self, until: u64) {
        let until = until.min(self.end);
        if self.loc >= until {
            return;
        }
        self.rows.push(UnwindRow {
            start: self.loc,
            end: until,
            cfa: self.state.cfa.clone(),
            registers: self.state.registers.clone(),
        });
    }

    fn factored(&self, factored_offset: i64) -> Result<i64> {
        factored_offset
            .checked_mul(self.data_alignment_factor)
            .ok_or(Error::Overflow)
    }

    fn factored_unsigned(&self, factored_offset: u64) -> Result<i64> {
        self.factored(i64::try_from(factored_offset).map_err(|_| Error::Overflow)?)
    }

    fn cfa_register_offset(&mut self) -> Result<(&mut u16, &mut i64)> {
        match &mut self.state.cfa {
            CfaRule::RegisterOffset { register, offset } => Ok((register, offset)),
            CfaRule::Expression(_) => Err(Error::CfaNotRegisterBased),
        }
    }

    fn execute(&mut self, instruction: Instruction<'a>) -> Result<()> {
        trace!(loc = self.loc, ?instruction);
        match instruction {
            Instruction::SetLoc(address) => {
                self.fde_only(&instruction)?;
                self.advance_to(address)?;
            }
            Instruction::AdvanceLoc { delta } => {
                self.fde_only(&instruction)?;
                let new_loc = u64::from(delta)
                    .checked_mul(self.code_alignment_factor)
                    .and_then(|delta| self.loc.checked_add(delta))
                    .ok_or(Error::Overflow)?;
                self.advance_to(new_loc)?;
            }
            Instruction::DefCfa { register, offset } => {
                let offset = i64::try_from(offset).map_err(|_| Error::Overflow)?;
                self.state.cfa = CfaRule::RegisterOffset { register, offset };
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset)?;
                self.state.cfa = CfaRule::RegisterOffset { register, offset };
            }
            Instruction::DefCfaRegister(new_register) => {
                let (register, _) = self.cfa_register_offset()?;
                *register = new_register;
            }
            Instruction::DefCfaOffset(new_offset) => {
                let new_offset = i64::try_from(new_offset).map_err(|_| Error::Overflow)?;
                let (_, offset) = self.cfa_register_offset()?;
                *offset = new_offset;
            }
            Instruction::DefCfaOffsetSf(factored_offset) => {
                let new_offset = self.factored(factored_offset)?;
                let (_, offset) = self.cfa_register_offset()?;
                *offset = new_offset;
            }
            Instruction::DefCfaExpression(expr) => {
                self.state.cfa = CfaRule::Expression(expr);
            }
            Instruction::Undefined(register) => {
                self.state.registers.set(register, RegisterRule::Undefined);
            }
            Instruction::SameValue(register) => {
                self.state.registers.set(register, RegisterRule::SameValue);
            }
            Instruction::Offset {
                register,
                factored_offset,
            } => {
                let offset = self.factored_unsigned(factored_offset)?;
                self.state.registers.set(register, RegisterRule::Offset(offset));
            }
            Instruction::OffsetExtendedSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset)?;
                self.state.registers.set(register, RegisterRule::Offset(offset));
            }
            Instruction::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = self.factored_unsigned(factored_offset)?;
                self.state.registers.set(register, RegisterRule::ValOffset(offset));
            }
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset)?;
                self.state.registers.set(register, RegisterRule::ValOffset(offset));
            }
            Instruction::Register { register, from } => {
                self.state.registers.set(register, RegisterRule::Register(from));
            }
            Instruction::Expression { register, expr } => {
                self.state.registers.set(register, RegisterRule::Expression(expr));
            }
            Instruction::ValExpression { register, expr } => {
                self.state.registers.set(register, RegisterRule::ValExpression(expr));
            }
            Instruction::Restore(register) => {
                let Some(initial) = self.initial else {
                    return Err(Error::InvalidCieInstruction(instruction.name()));
                };
                match initial.registers.get(register) {
                    Some(rule) => self.state.registers.set(register, rule.clone()),
                    None => self.state.registers.remove(register),
                }
            }
            Instruction::RememberState => {
                self.fde_only(&instruction)?;
                self.stack.push(self.state.clone());
            }
            Instruction::RestoreState => {
                self.fde_only(&instruction)?;
                self.state = self.stack.pop().ok_or(Error::UnbalancedRestore)?;
            }
            Instruction::GnuArgsSize(_) | Instruction::Nop => {}
        }
        Ok(())
    }
}
