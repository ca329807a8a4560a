use std::fmt;

use crate::wire_types::{ValueType, PROTOCOL_VERSION};

/// Errors that can arise when encoding/decoding a binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too short for the expected fields.
    Truncated,
    /// Unknown message type in the header.
    UnknownMessageType(u8),
    /// A valid message type where a different one was expected.
    UnexpectedMessageType(u8),
    /// Unsupported or mismatched protocol version.
    VersionMismatch(u8),
    /// A value type byte this version cannot size, so the rest of the
    /// body cannot be skipped.
    UnknownValueType { tag: u16, value_type: u8 },
    /// A known tag carrying the wrong value type.
    TypeMismatch {
        tag: u16,
        expected: ValueType,
        found: ValueType,
    },
    InvalidUtf8(u16),
    InvalidDecimal(u16),
    /// Enum discriminant out of range or another semantic issue.
    InvalidField(&'static str),
    MissingField(&'static str),
    /// A value longer than its length prefix can describe.
    FieldTooLong(u16),
    FrameTooLarge(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated => write!(f, "Buffer truncated"),
            ProtocolError::UnknownMessageType(t) => write!(f, "Unknown message type: {}", t),
            ProtocolError::UnexpectedMessageType(t) => write!(f, "Unexpected message type: {}", t),
            ProtocolError::VersionMismatch(v) => {
                write!(f, "Protocol version mismatch: got {}, expected {}", v, PROTOCOL_VERSION)
            }
            ProtocolError::UnknownValueType { tag, value_type } => {
                write!(f, "Unknown value type {} for tag {}", value_type, tag)
            }
            ProtocolError::TypeMismatch { tag, expected, found } => write!(
                f,
                "Tag {} has type {}, expected {}",
                tag,
                found.name(),
                expected.name()
            ),
            ProtocolError::InvalidUtf8(tag) => write!(f, "Malformed UTF-8 in tag {}", tag),
            ProtocolError::InvalidDecimal(tag) => write!(f, "Malformed decimal in tag {}", tag),
            ProtocolError::InvalidField(field) => write!(f, "Invalid field: {}", field),
            ProtocolError::MissingField(field) => write!(f, "Missing field: {}", field),
            ProtocolError::FieldTooLong(tag) => write!(f, "Value too long for tag {}", tag),
            ProtocolError::FrameTooLarge(len) => write!(f, "Frame of {} bytes exceeds limit", len),
        }
    }
}

impl std::error::Error for ProtocolError {}
