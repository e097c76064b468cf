//! Primitive readers: LEB128, NUL-terminated strings and a bounds-checked
//! cursor for the fixed-width fields.

use alloc::vec::Vec;
use core::ffi::CStr;

use super::Endian;
use crate::error::{Error, Result};

/// Decodes an unsigned LEB128 value from the start of `bytes`.
///
/// Returns `(value, consumed)`. Payload bits beyond the 64th are dropped, so
/// padded encodings still decode to their numeric value.
pub fn read_uleb128(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift < 64 {
            result |= u64::from(byte & 0b0111_1111) << shift;
        }
        shift = shift.saturating_add(7);
        if (byte >> 7) == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(Error::TruncatedInput { offset: 0 })
}

/// Decodes a signed LEB128 value from the start of `bytes`.
pub fn read_sleb128(bytes: &[u8]) -> Result<(i64, usize)> {
    let mut result = 0;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift < 64 {
            result |= i64::from(byte & 0b0111_1111) << shift;
        }
        shift = shift.saturating_add(7);
        if (byte >> 7) == 0 {
            let sign_bit_set = ((byte >> 6) & 1) == 1;
            if shift < 64 && sign_bit_set {
                result |= -1 << shift;
            }
            return Ok((result, i + 1));
        }
    }
    Err(Error::TruncatedInput { offset: 0 })
}

/// Reads a NUL-terminated UTF-8 string. The NUL counts towards `consumed`
/// but is not part of the returned text.
pub fn parse_string(bytes: &[u8]) -> Result<(&str, usize)> {
    let cstr = CStr::from_bytes_until_nul(bytes).map_err(|_| Error::MalformedString { offset: 0 })?;
    let utf8 = cstr.to_str().map_err(|_| Error::InvalidUtf8 { offset: 0 })?;
    Ok((utf8, utf8.len() + 1))
}

/// Appends the minimal unsigned LEB128 encoding of `value`.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0b0111_1111) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0b1000_0000);
    }
}

/// Appends the minimal signed LEB128 encoding of `value`.
pub fn write_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0b0111_1111) as u8;
        value >>= 7;
        let sign_bit_set = (byte & 0b0100_0000) != 0;
        if (value == 0 && !sign_bit_set) || (value == -1 && sign_bit_set) {
            out.push(byte);
            return;
        }
        out.push(byte | 0b1000_0000);
    }
}

/// A cursor over a window of the section. Offsets reported in errors are
/// section offsets, not window offsets.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    base: usize,
    pos: usize,
    endian: Endian,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            base: 0,
            pos: 0,
            endian,
        }
    }

    /// Section offset of the next byte to be read.
    pub(crate) fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated(&self) -> Error {
        Error::TruncatedInput {
            offset: self.offset(),
        }
    }

    pub(crate) fn bytes(&mut self, amount: usize) -> Result<&'a [u8]> {
        if self.remaining() < amount {
            return Err(self.truncated());
        }
        let result = &self.data[self.pos..self.pos + amount];
        self.pos += amount;
        Ok(result)
    }

    /// Everything up to the end of the window.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let result = &self.data[self.pos..];
        self.pos = self.data.len();
        result
    }

    /// Splits the next `amount` bytes off into their own reader.
    pub(crate) fn split(&mut self, amount: usize) -> Result<Reader<'a>> {
        let base = self.offset();
        let data = self.bytes(amount)?;
        Ok(Reader {
            data,
            base,
            pos: 0,
            endian: self.endian,
        })
    }

    /// A reader over `data`, which starts at section offset `base`.
    pub(crate) fn at(data: &'a [u8], base: usize, endian: Endian) -> Self {
        Self {
            data,
            base,
            pos: 0,
            endian,
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.bytes(N)?);
        Ok(array)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let bytes = self.array()?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let bytes = self.array()?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let bytes = self.array()?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    /// A target-address-sized unsigned value.
    pub(crate) fn address(&mut self, address_size: u8) -> Result<u64> {
        match address_size {
            4 => self.u32().map(u64::from),
            8 => self.u64(),
            size => Err(Error::UnsupportedAddressSize(size)),
        }
    }

    pub(crate) fn uleb128(&mut self) -> Result<u64> {
        let (value, consumed) = read_uleb128(&self.data[self.pos..]).map_err(|_| self.truncated())?;
        self.pos += consumed;
        Ok(value)
    }

    pub(crate) fn sleb128(&mut self) -> Result<i64> {
        let (value, consumed) = read_sleb128(&self.data[self.pos..]).map_err(|_| self.truncated())?;
        self.pos += consumed;
        Ok(value)
    }

    /// Reads a NUL-terminated string. Without a terminator the rest of the
    /// window is consumed.
    pub(crate) fn string(&mut self) -> Result<&'a str> {
        let offset = self.offset();
        let bytes = &self.data[self.pos..];
        match parse_string(bytes) {
            Ok((string, consumed)) => {
                self.pos += consumed;
                Ok(string)
            }
            Err(Error::MalformedString { .. }) => {
                self.pos = self.data.len();
                Err(Error::MalformedString { offset })
            }
            Err(_) => Err(Error::InvalidUtf8 { offset }),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn uleb128() {
        assert_eq!(read_uleb128(&[0xE5, 0x8E, 0x26]).unwrap(), (624485, 3));
        assert_eq!(read_uleb128(&[0x02]).unwrap(), (2, 1));
        assert_eq!(read_uleb128(&[0x7f, 0xff]).unwrap(), (127, 1));
        assert_eq!(read_uleb128(&[0x80, 0x01]).unwrap(), (128, 2));
    }

    #[test]
    fn sleb128() {
        assert_eq!(read_sleb128(&[0x9B, 0xF1, 0x59]).unwrap(), (-624485, 3));
        assert_eq!(read_sleb128(&[0x7c]).unwrap(), (-4, 1));
        assert_eq!(read_sleb128(&[0x78]).unwrap(), (-8, 1));
        assert_eq!(read_sleb128(&[0x3f]).unwrap(), (63, 1));
        assert_eq!(read_sleb128(&[0xc0, 0x00]).unwrap(), (64, 2));
    }

    #[test]
    fn leb128_truncated() {
        assert_eq!(read_uleb128(&[0xE5, 0x8E]), Err(Error::TruncatedInput { offset: 0 }));
        assert_eq!(read_sleb128(&[]), Err(Error::TruncatedInput { offset: 0 }));
    }

    #[test]
    fn leb128_padded() {
        assert_eq!(read_uleb128(&[0x85, 0x80, 0x80, 0x00]).unwrap(), (5, 4));
        assert_eq!(read_sleb128(&[0xff, 0xff, 0x7f]).unwrap(), (-1, 3));
    }

    #[test]
    fn leb128_extremes() {
        let mut out = Vec::new();
        write_uleb128(&mut out, u64::MAX);
        assert_eq!(out.len(), 10);
        assert_eq!(read_uleb128(&out).unwrap(), (u64::MAX, 10));

        out.clear();
        write_sleb128(&mut out, i64::MIN);
        assert_eq!(read_sleb128(&out).unwrap(), (i64::MIN, out.len()));
    }

    #[test]
    fn string() {
        assert_eq!(parse_string(&[b'h', b'i', 0x00, 0xFF, 0xCC]).unwrap(), ("hi", 3));
        assert_eq!(parse_string(&[0x00]).unwrap(), ("", 1));
        assert_eq!(parse_string(b"zR"), Err(Error::MalformedString { offset: 0 }));
    }

    #[test]
    fn reader_string_leaves_trailing_bytes() {
        let data = [b'h', b'i', 0x00, 0xFF, 0xCC];
        let mut reader = Reader::new(&data, Endian::Little);
        assert_eq!(reader.string().unwrap(), "hi");
        assert_eq!(reader.offset(), 3);
        assert_eq!(reader.rest(), &[0xFF, 0xCC]);
    }

    #[test]
    fn reader_string_without_nul_consumes_everything() {
        let data = [0x00, b'a', b'b'];
        let mut reader = Reader::new(&data, Endian::Little);
        reader.u8().unwrap();
        assert_eq!(reader.string(), Err(Error::MalformedString { offset: 1 }));
        assert!(reader.is_empty());
    }

    #[test]
    fn reader_fixed_width() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0];
        let mut little = Reader::new(&data, Endian::Little);
        assert_eq!(little.u16().unwrap(), 0x3412);
        assert_eq!(little.u32().unwrap(), 0xbc9a7856);
        assert_eq!(little.u16().unwrap(), 0xf0de);
        assert_eq!(little.u8(), Err(Error::TruncatedInput { offset: 8 }));

        let mut big = Reader::new(&data, Endian::Big);
        assert_eq!(big.address(4).unwrap(), 0x12345678);
        let mut big = Reader::new(&data, Endian::Big);
        assert_eq!(big.address(8).unwrap(), 0x123456789abcdef0);
        assert_eq!(big.address(2), Err(Error::UnsupportedAddressSize(2)));
    }

    #[test]
    fn reader_split_keeps_section_offsets() {
        let data = [1, 2, 3, 4, 0x80];
        let mut reader = Reader::new(&data, Endian::Little);
        reader.u8().unwrap();
        let mut window = reader.split(3).unwrap();
        assert_eq!(reader.offset(), 4);
        assert_eq!(window.offset(), 1);
        assert_eq!(window.u16().unwrap(), 0x0302);
        assert_eq!(window.u16(), Err(Error::TruncatedInput { offset: 3 }));
        assert_eq!(reader.uleb128(), Err(Error::TruncatedInput { offset: 4 }));
        assert!(reader.split(2).is_err());
    }

    proptest! {
        #[test]
        fn uleb128_reencodes_to_same_value(value in any::<u64>(), padding in 0usize..4) {
            let mut bytes = Vec::new();
            write_uleb128(&mut bytes, value);
            // pad with redundant continuation bytes
            if padding > 0 {
                let last = bytes.len() - 1;
                bytes[last] |= 0x80;
                bytes.extend(core::iter::repeat(0x80).take(padding - 1));
                bytes.push(0x00);
            }
            let (decoded, consumed) = read_uleb128(&bytes).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, bytes.len());

            let mut canonical = Vec::new();
            write_uleb128(&mut canonical, decoded);
            prop_assert_eq!(read_uleb128(&canonical).unwrap().0, value);
        }

        #[test]
        fn sleb128_reencodes_to_same_value(value in any::<i64>()) {
            let mut bytes = Vec::new();
            write_sleb128(&mut bytes, value);
            let (decoded, consumed) = read_sleb128(&bytes).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, bytes.len());
        }

        #[test]
        fn leb128_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..16)) {
            let _ = read_uleb128(&bytes);
            let _ = read_sleb128(&bytes);
        }
    }
}
