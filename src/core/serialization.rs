//! # Wire Codec
//!
//! Typed primitives to and from little-endian byte sequences.
//!
//! [`DataBuilder`] appends values in call order; [`DataReader`] consumes them in the
//! same order, advancing an internal cursor. Both go through the little-endian
//! accessors of [`bytes`], so the encoding is identical on every host.
//!
//! ## Encoding
//! - Integers and floats: fixed width, little-endian
//! - `bool`: one byte (`0` or `1`)
//! - `char`: one UTF-16 code unit (2 bytes)
//! - Strings: `[i32 code unit count] || [count x u16 code units]`. An empty string is
//!   just the 4-byte zero length.
//! - Enums: their declared [`EnumWidth`], `i32` unless stated otherwise
//!
//! ## Usage
//! ```rust
//! use hybrid_net::core::serialization::{DataBuilder, DataReader};
//!
//! let mut builder = DataBuilder::new();
//! builder.string("hello").u16(25000);
//! let bytes = builder.freeze();
//!
//! let mut reader = DataReader::new(&bytes);
//! assert_eq!(reader.string().unwrap(), "hello");
//! assert_eq!(reader.u16().unwrap(), 25000);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Code unit written for a `char` that does not fit a single UTF-16 unit.
const REPLACEMENT_UNIT: u16 = 0xFFFD;

/// Integer width used to encode an enum discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumWidth {
    U8,
    I8,
    I16,
    U16,
    #[default]
    I32,
    U32,
    I64,
    U64,
}

impl EnumWidth {
    /// Encoded size in bytes
    pub fn size(self) -> usize {
        match self {
            EnumWidth::U8 | EnumWidth::I8 => 1,
            EnumWidth::I16 | EnumWidth::U16 => 2,
            EnumWidth::I32 | EnumWidth::U32 => 4,
            EnumWidth::I64 | EnumWidth::U64 => 8,
        }
    }
}

/// An enum that travels as its integer discriminant.
pub trait WireEnum: Sized + Copy {
    /// Underlying integer width on the wire.
    const WIDTH: EnumWidth = EnumWidth::I32;

    fn discriminant(self) -> i64;

    fn from_discriminant(value: i64) -> Option<Self>;
}

/// Appends typed values to a growing byte buffer.
#[derive(Debug, Default, Clone)]
pub struct DataBuilder {
    data: BytesMut,
}

impl DataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Append raw bytes without any prefix
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_slice(bytes);
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.data.put_i8(value);
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.data.put_u8(u8::from(value));
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.data.put_i16_le(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16_le(value);
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.data.put_i32_le(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32_le(value);
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.data.put_i64_le(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.data.put_u64_le(value);
        self
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.data.put_f32_le(value);
        self
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.data.put_f64_le(value);
        self
    }

    /// Append a single UTF-16 code unit.
    ///
    /// Characters outside the Basic Multilingual Plane are written as U+FFFD.
    pub fn char(&mut self, value: char) -> &mut Self {
        let mut units = [0u16; 2];
        let encoded = value.encode_utf16(&mut units);
        let unit = if encoded.len() == 1 {
            encoded[0]
        } else {
            REPLACEMENT_UNIT
        };
        self.data.put_u16_le(unit);
        self
    }

    /// Append a length-prefixed UTF-16 string.
    ///
    /// At most [`MAX_STRING_UNITS`] code units are written; the prefix always matches
    /// the number of units that follow it.
    pub fn string(&mut self, value: &str) -> &mut Self {
        let units: Vec<u16> = value.encode_utf16().collect();
        let count = string_prefix(units.len());
        let written = units.len().min(MAX_STRING_UNITS);
        self.data.reserve(4 + written * 2);
        self.data.put_i32_le(count);
        for &unit in &units[..written] {
            self.data.put_u16_le(unit);
        }
        self
    }

    /// Append an enum using its declared width
    pub fn enumeration<E: WireEnum>(&mut self, value: E) -> &mut Self {
        let raw = value.discriminant();
        match E::WIDTH {
            EnumWidth::U8 => self.data.put_u8(raw as u8),
            EnumWidth::I8 => self.data.put_i8(raw as i8),
            EnumWidth::I16 => self.data.put_i16_le(raw as i16),
            EnumWidth::U16 => self.data.put_u16_le(raw as u16),
            EnumWidth::I32 => self.data.put_i32_le(raw as i32),
            EnumWidth::U32 => self.data.put_u32_le(raw as u32),
            EnumWidth::I64 => self.data.put_i64_le(raw),
            EnumWidth::U64 => self.data.put_u64_le(raw as u64),
        }
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Finish building and return the immutable bytes
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

/// Longest string the length prefix can describe, in UTF-16 code units
pub const MAX_STRING_UNITS: usize = i32::MAX as usize;

fn string_prefix(units: usize) -> i32 {
    i32::try_from(units).unwrap_or(i32::MAX)
}

/// Consumes typed values from a byte slice in encoding order.
///
/// A read either succeeds and advances past the value, or fails and leaves the cursor
/// untouched. Reading past the end yields [`ProtocolError::UnexpectedEof`]; a value
/// that decodes to nothing valid yields [`ProtocolError::InvalidData`].
#[derive(Debug, Clone)]
pub struct DataReader<'a> {
    buf: &'a [u8],
}

impl<'a> DataReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { buf: data }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Everything not consumed yet
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(ProtocolError::UnexpectedEof {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Take `count` raw bytes
    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.ensure(count)?;
        let (head, tail) = self.buf.split_at(count);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn char(&mut self) -> Result<char> {
        self.ensure(2)?;
        let mut cursor = self.buf;
        let unit = cursor.get_u16_le();
        let value = char::from_u32(u32::from(unit))
            .ok_or_else(|| ProtocolError::InvalidData(format!("lone surrogate 0x{unit:04X}")))?;
        self.buf = cursor;
        Ok(value)
    }

    pub fn string(&mut self) -> Result<String> {
        self.ensure(4)?;
        let count = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if count < 0 {
            return Err(ProtocolError::InvalidData(format!(
                "negative string length {count}"
            )));
        }
        let byte_len = (count as usize).saturating_mul(2);
        self.ensure(4 + byte_len)?;

        let mut cursor = self.buf;
        cursor.advance(4);
        let mut units = Vec::with_capacity(count as usize);
        for _ in 0..count {
            units.push(cursor.get_u16_le());
        }
        let value = String::from_utf16(&units)
            .map_err(|e| ProtocolError::InvalidData(format!("invalid UTF-16 string: {e}")))?;
        self.buf = cursor;
        Ok(value)
    }

    pub fn enumeration<E: WireEnum>(&mut self) -> Result<E> {
        let width = E::WIDTH;
        self.ensure(width.size())?;
        let mut cursor = self.buf;
        let raw = match width {
            EnumWidth::U8 => i64::from(cursor.get_u8()),
            EnumWidth::I8 => i64::from(cursor.get_i8()),
            EnumWidth::I16 => i64::from(cursor.get_i16_le()),
            EnumWidth::U16 => i64::from(cursor.get_u16_le()),
            EnumWidth::I32 => i64::from(cursor.get_i32_le()),
            EnumWidth::U32 => i64::from(cursor.get_u32_le()),
            EnumWidth::I64 => cursor.get_i64_le(),
            EnumWidth::U64 => cursor.get_u64_le() as i64,
        };
        let value = E::from_discriminant(raw).ok_or_else(|| {
            ProtocolError::InvalidData(format!("unknown enum discriminant {raw}"))
        })?;
        self.buf = cursor;
        Ok(value)
    }
}
