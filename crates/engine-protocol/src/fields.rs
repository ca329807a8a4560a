//! Tagged key/value body encoding.
//!
//! A body is a flat run of fields, each `[tag: u16 BE][value_type: u8][value]`
//! (value layouts are listed on [`ValueType`]). Nested structs are
//! `Message` values holding their own run of fields. Because every value
//! is self-sizing, readers skip tags they do not know.

use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use rust_decimal::Decimal;

use crate::error::ProtocolError;
use crate::wire_types::ValueType;

/// Appends fields to a buffer.
pub struct FieldWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        FieldWriter { buf }
    }

    fn tag(&mut self, tag: u16, ty: ValueType) {
        self.buf.put_u16(tag);
        self.buf.put_u8(ty as u8);
    }

    pub fn string(&mut self, tag: u16, v: &str) -> Result<(), ProtocolError> {
        let len = u32::try_from(v.len()).map_err(|_| ProtocolError::FieldTooLong(tag))?;
        self.tag(tag, ValueType::String);
        self.buf.put_u32(len);
        self.buf.put_slice(v.as_bytes());
        Ok(())
    }

    pub fn u32(&mut self, tag: u16, v: u32) {
        self.tag(tag, ValueType::U32);
        self.buf.put_u32(v);
    }

    pub fn u64(&mut self, tag: u16, v: u64) {
        self.tag(tag, ValueType::U64);
        self.buf.put_u64(v);
    }

    pub fn i32(&mut self, tag: u16, v: i32) {
        self.tag(tag, ValueType::I32);
        self.buf.put_i32(v);
    }

    pub fn i64(&mut self, tag: u16, v: i64) {
        self.tag(tag, ValueType::I64);
        self.buf.put_i64(v);
    }

    pub fn bool(&mut self, tag: u16, v: bool) {
        self.tag(tag, ValueType::Bool);
        self.buf.put_u8(u8::from(v));
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp(&mut self, tag: u16, nanos: i64) {
        self.tag(tag, ValueType::Timestamp);
        self.buf.put_i64(nanos);
    }

    pub fn decimal(&mut self, tag: u16, v: Decimal) -> Result<(), ProtocolError> {
        let s = v.to_string();
        let len = u16::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong(tag))?;
        self.tag(tag, ValueType::BigDecimal);
        self.buf.put_u16(len);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Writes a nested message; `body` fills in its fields.
    pub fn message<F>(&mut self, tag: u16, body: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut FieldWriter<'_>) -> Result<(), ProtocolError>,
    {
        self.tag(tag, ValueType::Message);
        let len_at = self.buf.len();
        self.buf.put_u32(0);
        let start = self.buf.len();

        body(&mut FieldWriter { buf: &mut *self.buf })?;

        let len = u32::try_from(self.buf.len() - start).map_err(|_| ProtocolError::FieldTooLong(tag))?;
        self.buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

/// A decoded value borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    String(&'a str),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    Bool(bool),
    Timestamp(i64),
    BigDecimal(Decimal),
    Message(&'a [u8]),
}

impl<'a> Value<'a> {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::Bool(_) => ValueType::Bool,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::BigDecimal(_) => ValueType::BigDecimal,
            Value::Message(_) => ValueType::Message,
        }
    }

    fn mismatch(&self, tag: u16, expected: ValueType) -> ProtocolError {
        ProtocolError::TypeMismatch {
            tag,
            expected,
            found: self.value_type(),
        }
    }

    pub fn as_str(self, tag: u16) -> Result<&'a str, ProtocolError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch(tag, ValueType::String)),
        }
    }

    pub fn as_string(self, tag: u16) -> Result<String, ProtocolError> {
        self.as_str(tag).map(str::to_owned)
    }

    pub fn as_u32(self, tag: u16) -> Result<u32, ProtocolError> {
        match self {
            Value::U32(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::U32)),
        }
    }

    pub fn as_u64(self, tag: u16) -> Result<u64, ProtocolError> {
        match self {
            Value::U64(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::U64)),
        }
    }

    pub fn as_i32(self, tag: u16) -> Result<i32, ProtocolError> {
        match self {
            Value::I32(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::I32)),
        }
    }

    pub fn as_i64(self, tag: u16) -> Result<i64, ProtocolError> {
        match self {
            Value::I64(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::I64)),
        }
    }

    pub fn as_bool(self, tag: u16) -> Result<bool, ProtocolError> {
        match self {
            Value::Bool(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::Bool)),
        }
    }

    pub fn as_timestamp(self, tag: u16) -> Result<i64, ProtocolError> {
        match self {
            Value::Timestamp(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::Timestamp)),
        }
    }

    pub fn as_decimal(self, tag: u16) -> Result<Decimal, ProtocolError> {
        match self {
            Value::BigDecimal(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::BigDecimal)),
        }
    }

    pub fn as_message(self, tag: u16) -> Result<&'a [u8], ProtocolError> {
        match self {
            Value::Message(v) => Ok(v),
            other => Err(other.mismatch(tag, ValueType::Message)),
        }
    }

    /// Enum discriminants travel as `U32` and are converted by `from`.
    pub fn as_enum<T>(self, tag: u16, name: &'static str, from: impl FnOnce(u8) -> Option<T>) -> Result<T, ProtocolError> {
        let raw = self.as_u32(tag)?;
        u8::try_from(raw)
            .ok()
            .and_then(from)
            .ok_or(ProtocolError::InvalidField(name))
    }
}

/// Iterates the fields of one body.
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FieldReader { buf }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(n)?;
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn take_u32_prefixed(&mut self) -> Result<&'a [u8], ProtocolError> {
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.take(len)
    }

    /// Next `(tag, value)`, or `None` at the end of the body.
    pub fn next_field(&mut self) -> Result<Option<(u16, Value<'a>)>, ProtocolError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        self.need(3)?;
        let tag = self.buf.get_u16();
        let raw = self.buf.get_u8();
        let ty = ValueType::from_u8(raw).ok_or(ProtocolError::UnknownValueType { tag, value_type: raw })?;

        let value = match ty {
            ValueType::String => {
                let bytes = self.take_u32_prefixed()?;
                Value::String(std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(tag))?)
            }
            ValueType::U32 => {
                self.need(4)?;
                Value::U32(self.buf.get_u32())
            }
            ValueType::U64 => {
                self.need(8)?;
                Value::U64(self.buf.get_u64())
            }
            ValueType::I32 => {
                self.need(4)?;
                Value::I32(self.buf.get_i32())
            }
            ValueType::I64 => {
                self.need(8)?;
                Value::I64(self.buf.get_i64())
            }
            ValueType::Bool => {
                self.need(1)?;
                Value::Bool(self.buf.get_u8() != 0)
            }
            ValueType::Timestamp => {
                self.need(8)?;
                Value::Timestamp(self.buf.get_i64())
            }
            ValueType::BigDecimal => {
                self.need(2)?;
                let len = self.buf.get_u16() as usize;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidDecimal(tag))?;
                Value::BigDecimal(Decimal::from_str(s).map_err(|_| ProtocolError::InvalidDecimal(tag))?)
            }
            ValueType::Message => Value::Message(self.take_u32_prefixed()?),
        };

        Ok(Some((tag, value)))
    }
}
