//! The unwind table: the rows the call frame instructions describe, and the
//! lookup from a program counter to its row.
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program (a relative offset in shared object files). The remaining columns
//! contain unwinding rules that are associated with the indicated location.
//!
//! The CFA column defines the rule which computes the Canonical Frame Address
//! value; it may be either a register and a signed offset that are added
//! together, or a DWARF expression that is evaluated.
//!
//! Everything here is immutable once built, so a table can be shared between
//! any number of threads walking stacks at the same time.


use alloc::vec::Vec;
use core::fmt;

use super::machine;
use super::parse::FrameSection;
use super::ParseOptions;
use crate::arch::RegisterNames;
use crate::error::{Error, Result};

/// A DWARF expression, stored verbatim. Evaluating it is up to whoever walks
/// the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expression<'a>(pub &'a [u8]);

/// How to compute the Canonical Frame Address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfaRule<'a> {
    RegisterOffset { register: u16, offset: i64 },
    Expression(Expression<'a>),
}

impl Default for CfaRule<'_> {
    fn default() -> Self {
        CfaRule::RegisterOffset {
            register: 0,
            offset: 0,
        }
    }
}

/// Where the caller's value of one register can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRule<'a> {
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    SameValue,
    /// The previous value of this register is saved at the address CFA+N.
    Offset(i64),
    /// The previous value of this register is the value CFA+N.
    ValOffset(i64),
    /// The previous value of this register is stored in another register.
    Register(u16),
    /// The previous value of this register is saved at the address the
    /// expression computes.
    Expression(Expression<'a>),
    /// The previous value of this register is the value the expression
    /// computes.
    ValExpression(Expression<'a>),
}

/// Rules for the registers that have one, sorted by register number.
/// Registers that are not in here are [`RegisterRule::Undefined`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterRules<'a>(Vec<(u16, RegisterRule<'a>)>);

impl<'a> RegisterRules<'a> {
    pub fn get(&self, register: u16) -> Option<&RegisterRule<'a>> {
        self.0
            .binary_search_by_key(&register, |(r, _)| *r)
            .ok()
            .map(|index| &self.0[index].1)
    }

    pub(crate) fn set(&mut self, register: u16, rule: RegisterRule<'a>) {
        match self.0.binary_search_by_key(&register, |(r, _)| *r) {
            Ok(index) => self.0[index].1 = rule,
            Err(index) => self.0.insert(index, (register, rule)),
        }
    }

    pub(crate) fn remove(&mut self, register: u16) {
        if let Ok(index) = self.0.binary_search_by_key(&register, |(r, _)| *r) {
            self.0.remove(index);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &RegisterRule<'a>)> {
        self.0.iter().map(|(register, rule)| (*register, rule))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The rules that hold for every pc in `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindRow<'a> {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) cfa: CfaRule<'a>,
    pub(crate) registers: RegisterRules<'a>,
}

impl<'a> UnwindRow<'a> {
    /// The location counter value the row was emitted at.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    pub fn cfa(&self) -> &CfaRule<'a> {
        &self.cfa
    }

    /// The rule for `register`.
    pub fn rule(&self, register: u16) -> &RegisterRule<'a> {
        self.registers.get(register).unwrap_or(&RegisterRule::Undefined)
    }

    pub fn registers(&self) -> &RegisterRules<'a> {
        &self.registers
    }

    /// Renders the row the way `llvm-dwarfdump` does, with register names
    /// from `names`.
    pub fn display<'r, N: RegisterNames + ?Sized>(&'r self, names: &'r N) -> RowDisplay<'r, 'a, N> {
        RowDisplay { row: self, names }
    }
}

pub struct RowDisplay<'r, 'a, N: ?Sized> {
    row: &'r UnwindRow<'a>,
    names: &'r N,
}

struct Reg<'n, N: ?Sized>(&'n N, u16);

impl<N: RegisterNames + ?Sized> fmt::Display for Reg<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.name(self.1) {
            Some(name) => f.write_str(name),
            None => write!(f, "reg{}", self.1),
        }
    }
}

impl<N: RegisterNames + ?Sized> fmt::Display for RowDisplay<'_, '_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: CFA=", self.row.start)?;
        match &self.row.cfa {
            CfaRule::RegisterOffset { register, offset } => {
                write!(f, "{}{offset:+}", Reg(self.names, *register))?
            }
            CfaRule::Expression(_) => f.write_str("DW_OP_...")?,
        }
        let mut separator = ": ";
        for (register, rule) in self.row.registers.iter() {
            write!(f, "{separator}{}=", Reg(self.names, register))?;
            separator = ", ";
            match rule {
                RegisterRule::Undefined => f.write_str("undefined")?,
                RegisterRule::SameValue => f.write_str("same")?,
                RegisterRule::Offset(offset) => write!(f, "[CFA{offset:+}]")?,
                RegisterRule::ValOffset(offset) => write!(f, "CFA{offset:+}")?,
                RegisterRule::Register(from) => write!(f, "{}", Reg(self.names, *from))?,
                RegisterRule::Expression(_) => f.write_str("[DW_OP_...]")?,
                RegisterRule::ValExpression(_) => f.write_str("DW_OP_...")?,
            }
        }
        Ok(())
    }
}

/// The rows of one FDE, covering `[start, end)` without gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdeTable<'a> {
    pub(crate) fde_offset: usize,
    pub(crate) cie_offset: usize,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) return_address_register: u16,
    pub(crate) rows: Vec<UnwindRow<'a>>,
}

impl<'a> FdeTable<'a> {
    /// Section offset of the FDE the rows come from.
    pub fn fde_offset(&self) -> usize {
        self.fde_offset
    }

    pub fn cie_offset(&self) -> usize {
        self.cie_offset
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    /// The column holding the return address, from the CIE.
    pub fn return_address_register(&self) -> u16 {
        self.return_address_register
    }

    /// Rows ordered by strictly increasing location.
    pub fn rows(&self) -> &[UnwindRow<'a>] {
        &self.rows
    }

    /// The last row starting at or before `pc`, if `pc` is in this FDE.
    pub fn row_for(&self, pc: u64) -> Option<&UnwindRow<'a>> {
        if !self.contains(pc) {
            return None;
        }
        let index = self.rows.partition_point(|row| row.start <= pc);
        index.checked_sub(1).map(|index| &self.rows[index])
    }
}

/// All rows of all FDEs in a section, sorted by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwindTable<'a> {
    fdes: Vec<FdeTable<'a>>,
}

impl<'a> UnwindTable<'a> {
    /// Parses `bytes` and runs every FDE's instructions.
    pub fn parse(bytes: &'a [u8], options: ParseOptions) -> Result<Self> {
        let section = FrameSection::parse(bytes, options)?;
        Self::new(&section)
    }

    /// Runs the instructions of every FDE in `section`. Fails if any of them
    /// fails or if two FDEs claim the same address.
    #[instrument(skip_all)]
    pub fn new(section: &FrameSection<'a>) -> Result<Self> {
        let options = section.options();
        let mut fdes = Vec::new();

        for cie in section.cies() {
            let initial = machine::initial_state(cie, options)?;
            for fde in &cie.fdes {
                if fde.address_range == 0 {
                    debug!("skipping empty FDE at {:#x}", fde.offset);
                    continue;
                }
                fdes.push(machine::fde_table(cie, &initial, fde, options)?);
            }
        }

        fdes.sort_by_key(|fde: &FdeTable<'_>| fde.start);
        for pair in fdes.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(Error::OverlappingFdes {
                    first: pair[0].start,
                    second: pair[1].start,
                });
            }
        }

        debug!(
            fdes = fdes.len(),
            rows = fdes.iter().map(|fde| fde.rows.len()).sum::<usize>(),
            "built unwind table"
        );
        Ok(Self { fdes })
    }

    /// The FDE tables, sorted by start address.
    pub fn fdes(&self) -> &[FdeTable<'a>] {
        &self.fdes
    }

    pub fn len(&self) -> usize {
        self.fdes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fdes.is_empty()
    }

    /// The FDE whose range contains `pc`.
    pub fn fde_for(&self, pc: u64) -> Result<&FdeTable<'a>> {
        let index = self.fdes.partition_point(|fde| fde.start <= pc);
        index
            .checked_sub(1)
            .map(|index| &self.fdes[index])
            .filter(|fde| fde.contains(pc))
            .ok_or(Error::NoCoverage(pc))
    }

    /// The row that tells how to unwind out of `pc`.
    pub fn resolve(&self, pc: u64) -> Result<&UnwindRow<'a>> {
        self.fde_for(pc)?.row_for(pc).ok_or(Error::NoCoverage(pc))
    }
}
