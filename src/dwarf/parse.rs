//! Splits a call frame section into CIEs and FDEs.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.1 Structure of Call Frame
//! Information, and the LSB `.eh_frame` chapter for the augmentations.
//!
//! Every record starts with a 4 byte length (not counting itself) and a 4 byte
//! id. The id tells CIEs apart from FDEs; for an FDE it points at the CIE it
//! belongs to. CIEs come before the FDEs that use them, so an FDE is always
//! resolved against CIEs that have already been parsed.
#![allow(non_upper_case_globals)]


use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::fmt;

use super::instr::{InstrContext, InstrIter};
use super::read::Reader;
use super::ParseOptions;
use crate::error::{Error, Result};

/// Common Information Entry
#[derive(Debug, PartialEq)]
pub struct Cie<'a> {
    /// Section offset of the record, which is what FDEs use to find it.
    pub offset: usize,
    /// Length of the record, not including the length field itself.
    pub length: u32,
    /// The raw CIE id, `0xffffffff` in `.debug_frame` and `0` in `.eh_frame`.
    pub id: u32,
    pub version: u8,
    /// Empty in the common case. A leading `z` announces augmentation data.
    pub augmentation_string: &'a str,
    /// Parsed `z` augmentation data, if the augmentation string has any.
    pub augmentation: Option<Augmentation>,
    /// Size of a target address. Explicit in version 4 CIEs, taken from the
    /// parse options otherwise.
    pub address_size: u8,
    pub segment_selector_size: u8,
    /// Factored out of all advance location instructions.
    pub code_alignment_factor: u64,
    /// Factored out of the offset operands of register and CFA rules.
    pub data_alignment_factor: i64,
    /// The rule table column that holds the return address. It might not
    /// correspond to an actual machine register.
    pub return_address_register: u16,
    /// Interpreted to create the initial setting of each column.
    pub initial_instructions: &'a [u8],
    pub(crate) instructions_offset: usize,
    /// FDEs that point at this CIE, in section order.
    pub fdes: Vec<Fde<'a>>,
}

impl<'a> Cie<'a> {
    pub(crate) fn instruction_context(&self, options: &ParseOptions) -> InstrContext {
        InstrContext {
            address_size: self.address_size,
            segment_selector_size: self.segment_selector_size,
            pointer_encoding: self.pointer_encoding(),
            section_address: options.section_address,
        }
    }

    fn pointer_encoding(&self) -> Option<Encoding> {
        self.augmentation
            .and_then(|augmentation| augmentation.pointer_encoding)
            .filter(|encoding| !encoding.is_omit())
    }

    /// Decodes the initial instructions.
    pub fn initial_instruction_iter(&self, options: &ParseOptions) -> InstrIter<'a> {
        InstrIter::new(
            self.initial_instructions,
            self.instructions_offset,
            self.instruction_context(options),
            options.endian,
        )
    }
}

/// Frame Description Entry
#[derive(Debug, PartialEq)]
pub struct Fde<'a> {
    /// Section offset of the record.
    pub offset: usize,
    /// Length of the record, not including the length field itself.
    pub length: u32,
    /// The CIE pointer exactly as it is stored in the section.
    pub cie_pointer: u32,
    /// Section offset of the owning CIE.
    pub cie_offset: usize,
    pub(crate) cie_index: usize,
    /// The address of the first location described by this entry.
    pub initial_location: u64,
    /// The number of bytes of program instructions described by this entry.
    pub address_range: u64,
    /// Language specific data area, from the `L` augmentation.
    pub lsda: Option<u64>,
    pub instructions: &'a [u8],
    pub(crate) instructions_offset: usize,
}

impl<'a> Fde<'a> {
    /// End of the covered range, exclusive. `None` if it does not fit a `u64`.
    pub fn end(&self) -> Option<u64> {
        self.initial_location.checked_add(self.address_range)
    }

    /// Whether `pc` is in `[initial_location, initial_location + address_range)`.
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.initial_location && pc - self.initial_location < self.address_range
    }

    /// Decodes the instructions. `cie` must be the CIE this FDE points at.
    pub fn instruction_iter(&self, cie: &Cie<'_>, options: &ParseOptions) -> InstrIter<'a> {
        InstrIter::new(
            self.instructions,
            self.instructions_offset,
            cie.instruction_context(options),
            options.endian,
        )
    }
}

/// All CIEs of a section, each owning its FDEs.
///
/// The CIEs form an arena keyed by their section offset; FDEs remember the
/// arena slot of their CIE instead of holding a reference to it.
#[derive(Debug)]
pub struct FrameSection<'a> {
    cies: Vec<Cie<'a>>,
    cie_offsets: BTreeMap<usize, usize>,
    options: ParseOptions,
}

impl<'a> FrameSection<'a> {
    pub fn parse(bytes: &'a [u8], options: ParseOptions) -> Result<Self> {
        parse_section(bytes, options)
    }

    /// CIEs in section order.
    pub fn cies(&self) -> &[Cie<'a>] {
        &self.cies
    }

    /// The CIE that starts at section offset `offset`.
    pub fn cie_at(&self, offset: usize) -> Option<&Cie<'a>> {
        self.cie_offsets.get(&offset).map(|&index| &self.cies[index])
    }

    /// The CIE that owns `fde`. `None` if the FDE comes from another section.
    pub fn cie_of(&self, fde: &Fde<'a>) -> Option<&Cie<'a>> {
        self.cies
            .get(fde.cie_index)
            .filter(|cie| cie.offset == fde.cie_offset)
    }

    /// Every FDE together with its CIE, CIE by CIE.
    pub fn fdes(&self) -> impl Iterator<Item = (&Cie<'a>, &Fde<'a>)> {
        self.cies
            .iter()
            .flat_map(|cie| cie.fdes.iter().map(move |fde| (cie, fde)))
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }
}

/// Parses a whole call frame section. Any malformed record fails the whole
/// section.
#[instrument(skip(bytes), fields(len = bytes.len()))]
pub fn parse_section(bytes: &[u8], options: ParseOptions) -> Result<FrameSection<'_>> {
    options.validate()?;

    let mut section = FrameSection {
        cies: Vec::new(),
        cie_offsets: BTreeMap::new(),
        options,
    };
    let mut reader = Reader::new(bytes, options.endian);
    let mut fde_count = 0usize;

    while reader.remaining() >= 4 {
        let offset = reader.offset();
        let length = reader.u32()?;
        if length == 0 {
            trace!("terminator at {offset:#x}");
            break;
        }
        if length == 0xffff_ffff {
            // be careful, if you handle this the id and all offsets get 8 bytes wide
            return Err(Error::Dwarf64 { offset });
        }

        // The length is authoritative: whatever the typed fields leave over
        // belongs to the instruction stream.
        let mut record = reader.split(length as usize)?;
        let id_offset = record.offset();
        let id = record.u32()?;

        if options.kind.is_cie_id(id) {
            let cie = parse_cie(&mut record, offset, length, id, &options)?;
            section.cie_offsets.insert(offset, section.cies.len());
            section.cies.push(cie);
        } else {
            let index = options
                .kind
                .resolve_cie_pointer(id_offset, id)
                .and_then(|cie_offset| section.cie_offsets.get(&cie_offset).copied())
                .ok_or(Error::DanglingFde {
                    fde: offset,
                    cie_pointer: id,
                })?;
            let fde = parse_fde(&mut record, offset, length, id, index, &section.cies[index], &options)?;
            section.cies[index].fdes.push(fde);
            fde_count += 1;
        }
    }

    debug!(cies = section.cies.len(), fdes = fde_count, "parsed call frame section");
    Ok(section)
}

#[instrument(level = "trace", skip(record, options))]
fn parse_cie<'a>(
    record: &mut Reader<'a>,
    offset: usize,
    length: u32,
    id: u32,
    options: &ParseOptions,
) -> Result<Cie<'a>> {
    let version = record.u8()?;
    if !matches!(version, 1 | 3 | 4) {
        return Err(Error::UnsupportedVersion(version));
    }

    let augmentation_string = record.string()?;
    if !augmentation_string.is_empty() && !augmentation_string.starts_with('z') {
        return Err(Error::UnsupportedAugmentation(String::from(augmentation_string)));
    }

    let (address_size, segment_selector_size) = if version >= 4 {
        let address_size = record.u8()?;
        if !matches!(address_size, 4 | 8) {
            return Err(Error::UnsupportedAddressSize(address_size));
        }
        (address_size, record.u8()?)
    } else {
        (options.address_size, 0)
    };

    let code_alignment_factor = record.uleb128()?;
    let data_alignment_factor = record.sleb128()?;
    let return_address_register = if version >= 3 {
        register(record.uleb128()?)?
    } else {
        u16::from(record.u8()?)
    };

    let augmentation = if augmentation_string.starts_with('z') {
        let aug_len = record.uleb128()?;
        let mut aug_data = record.split(to_usize(aug_len)?)?;
        let aug = parse_augmentation_data(augmentation_string, &mut aug_data, address_size, options)?;
        trace!("augmentation {aug:?}");
        Some(aug)
    } else {
        None
    };

    let instructions_offset = record.offset();
    let initial_instructions = record.rest();

    let cie = Cie {
        offset,
        length,
        id,
        version,
        augmentation_string,
        augmentation,
        address_size,
        segment_selector_size,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        initial_instructions,
        instructions_offset,
        fdes: Vec::new(),
    };

    trace!(?cie.code_alignment_factor, ?cie.data_alignment_factor, "CIE at {offset:#x}");
    Ok(cie)
}

#[instrument(level = "trace", skip(record, cie, options))]
fn parse_fde<'a>(
    record: &mut Reader<'a>,
    offset: usize,
    length: u32,
    cie_pointer: u32,
    cie_index: usize,
    cie: &Cie<'_>,
    options: &ParseOptions,
) -> Result<Fde<'a>> {
    record.bytes(usize::from(cie.segment_selector_size))?;

    let (initial_location, address_range) = match cie.pointer_encoding() {
        Some(encoding) => {
            let initial_location =
                read_encoded(record, encoding, cie.address_size, options.section_address)?;
            // the range is a length, only the format applies to it
            let address_range = read_value(record, encoding.format()?, cie.address_size)?;
            (initial_location, address_range)
        }
        None => (record.address(cie.address_size)?, record.address(cie.address_size)?),
    };

    let lsda = match cie.augmentation {
        Some(augmentation) => {
            let aug_len = record.uleb128()?;
            let mut aug_data = record.split(to_usize(aug_len)?)?;
            match augmentation.lsda_encoding.filter(|encoding| !encoding.is_omit()) {
                Some(encoding) if !aug_data.is_empty() => Some(read_encoded(
                    &mut aug_data,
                    encoding,
                    cie.address_size,
                    options.section_address,
                )?),
                _ => None,
            }
        }
        None => None,
    };

    let instructions_offset = record.offset();
    let instructions = record.rest();

    trace!("FDE at {offset:#x}: [{initial_location:#x}, +{address_range:#x}) cie={:#x}", cie.offset);
    Ok(Fde {
        offset,
        length,
        cie_pointer,
        cie_offset: cie.offset,
        cie_index,
        initial_location,
        address_range,
        lsda,
        instructions,
        instructions_offset,
    })
}

/// The `z` augmentation data of a CIE (`.eh_frame` only in practice).
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Augmentation {
    /// `L`: encoding of the LSDA pointer in each FDE's augmentation data.
    pub lsda_encoding: Option<Encoding>,
    /// `P`: the personality routine.
    pub personality: Option<u64>,
    /// `R`: encoding of the address fields in each FDE.
    pub pointer_encoding: Option<Encoding>,
    /// `S`: FDEs using this CIE describe signal handler frames.
    pub signal_frame: bool,
}

fn parse_augmentation_data(
    string: &str,
    data: &mut Reader<'_>,
    address_size: u8,
    options: &ParseOptions,
) -> Result<Augmentation> {
    let mut aug = Augmentation::default();

    // the leading 'z' is the data we are reading right now
    for code in string.bytes().skip(1) {
        match code {
            // The argument in the Augmentation Data of the CIE is 1-byte and
            // represents the pointer encoding used for the LSDA pointer in the
            // Augmentation Data of the FDE.
            b'L' => aug.lsda_encoding = Some(Encoding(data.u8()?)),
            // 1-byte pointer encoding followed by the personality routine
            // pointer in that encoding.
            b'P' => {
                let encoding = Encoding(data.u8()?);
                if !encoding.is_omit() {
                    aug.personality =
                        Some(read_encoded(data, encoding, address_size, options.section_address)?);
                }
            }
            // 1-byte pointer encoding for the address fields of the FDE.
            b'R' => aug.pointer_encoding = Some(Encoding(data.u8()?)),
            b'S' => aug.signal_frame = true,
            _ => return Err(Error::UnsupportedAugmentation(String::from(string))),
        }
    }

    Ok(aug)
}

fn register(value: u64) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::InvalidRegister(value))
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Overflow)
}

/// A `DW_EH_PE_*` pointer encoding byte: low nibble is the value format,
/// bits 4..7 say what the value is relative to.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

const DW_EH_PE_omit: u8 = 0xff;
const DW_EH_PE_indirect: u8 = 0x80;

impl Encoding {
    /// The field is not present at all.
    pub fn is_omit(&self) -> bool {
        self.0 == DW_EH_PE_omit
    }

    fn format(&self) -> Result<ValueFormat> {
        Ok(match self.0 & 0b1111 {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return Err(Error::UnsupportedPointerEncoding(self.0)),
        })
    }

    fn application(&self) -> Result<ValueApplication> {
        Ok(match (self.0 & 0x70) >> 4 {
            0x0 => ValueApplication::DW_EH_PE_absptr,
            0x1 => ValueApplication::DW_EH_PE_pcrel,
            0x2 => ValueApplication::DW_EH_PE_textrel,
            0x3 => ValueApplication::DW_EH_PE_datarel,
            0x4 => ValueApplication::DW_EH_PE_funcrel,
            0x5 => ValueApplication::DW_EH_PE_aligned,
            _ => return Err(Error::UnsupportedPointerEncoding(self.0)),
        })
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.application(), self.format()) {
            (Ok(application), Ok(format)) => write!(f, "{application:?} | {format:?}"),
            _ => write!(f, "Encoding({:#04x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueFormat {
    /// A target address sized value.
    DW_EH_PE_absptr,
    DW_EH_PE_uleb128,
    DW_EH_PE_udata2,
    DW_EH_PE_udata4,
    DW_EH_PE_udata8,
    DW_EH_PE_sleb128,
    DW_EH_PE_sdata2,
    DW_EH_PE_sdata4,
    DW_EH_PE_sdata8,
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueApplication {
    DW_EH_PE_absptr,
    /// Value is relative to the address of the field itself.
    DW_EH_PE_pcrel,
    /// Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel,
    /// Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel,
    /// Value is relative to the beginning of the function.
    DW_EH_PE_funcrel,
    /// Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned,
}

fn read_value(reader: &mut Reader<'_>, format: ValueFormat, address_size: u8) -> Result<u64> {
    Ok(match format {
        ValueFormat::DW_EH_PE_absptr => reader.address(address_size)?,
        ValueFormat::DW_EH_PE_uleb128 => reader.uleb128()?,
        ValueFormat::DW_EH_PE_udata2 => u64::from(reader.u16()?),
        ValueFormat::DW_EH_PE_udata4 => u64::from(reader.u32()?),
        ValueFormat::DW_EH_PE_udata8 => reader.u64()?,
        ValueFormat::DW_EH_PE_sleb128 => reader.sleb128()? as u64,
        ValueFormat::DW_EH_PE_sdata2 => reader.u16()? as i16 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata4 => reader.u32()? as i32 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata8 => reader.u64()?,
    })
}

/// Reads a pointer in `encoding`. Only absolute and pc-relative pointers can
/// be resolved without knowing where text and data ended up.
pub(crate) fn read_encoded(
    reader: &mut Reader<'_>,
    encoding: Encoding,
    address_size: u8,
    section_address: u64,
) -> Result<u64> {
    if encoding.0 & DW_EH_PE_indirect != 0 {
        return Err(Error::UnsupportedPointerEncoding(encoding.0));
    }

    let field_offset = reader.offset() as u64;
    let value = read_value(reader, encoding.format()?, address_size)?;

    let value = match encoding.application()? {
        ValueApplication::DW_EH_PE_absptr => value,
        ValueApplication::DW_EH_PE_pcrel => section_address
            .checked_add(field_offset)
            .ok_or(Error::Overflow)?
            .wrapping_add(value),
        ValueApplication::DW_EH_PE_textrel
        | ValueApplication::DW_EH_PE_datarel
        | ValueApplication::DW_EH_PE_funcrel
        | ValueApplication::DW_EH_PE_aligned => {
            return Err(Error::UnsupportedPointerEncoding(encoding.0))
        }
    };

    Ok(match address_size {
        4 => value & 0xffff_ffff,
        _ => value,
    })
}
