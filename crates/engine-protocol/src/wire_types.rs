//! Low-level wire types and constants.
//!
//! This module defines:
//! - Message type IDs for the first byte of every payload.
//! - Protocol versioning.
//! - Value type IDs for the tagged key/value body.
//! - Stable field tags for every encoded struct.
//!
//! The actual encode/decode logic lives in `fields` and `binary_codec`.

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Every payload starts with `[msg_type][version][reserved; 2]`.
pub const HEADER_LEN: usize = 4;

/// Upper bound on a single length-prefixed frame.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Upper bound on a market id, coin symbol or similar short string.
pub const MAX_SYMBOL_LEN: usize = 32;

pub fn validate_symbol_len(len: usize) -> bool {
    len > 0 && len <= MAX_SYMBOL_LEN
}

/// Payload kinds.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireMessageType {
    /// One entry of a market event stream.
    Event = 1,
    /// An admitted order command.
    Command = 2,

    // Ingress requests (client → server).
    SubmitOrder = 20,
    CancelOrder = 21,
    GetBalances = 22,
    BalanceOp = 23,

    // Ingress responses (server → client).
    Accepted = 30,
    Rejected = 31,
    CancelResult = 32,
    Balances = 33,
}

impl WireMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WireMessageType::Event),
            2 => Some(WireMessageType::Command),
            20 => Some(WireMessageType::SubmitOrder),
            21 => Some(WireMessageType::CancelOrder),
            22 => Some(WireMessageType::GetBalances),
            23 => Some(WireMessageType::BalanceOp),
            30 => Some(WireMessageType::Accepted),
            31 => Some(WireMessageType::Rejected),
            32 => Some(WireMessageType::CancelResult),
            33 => Some(WireMessageType::Balances),
            _ => None,
        }
    }
}

/// Type of a single tagged value.
///
/// ```text
/// String    : u32 BE length + UTF-8 bytes
/// U32 / I32 : 4 bytes BE
/// U64 / I64 : 8 bytes BE
/// Bool      : 1 byte (0/1)
/// Timestamp : i64 BE nanoseconds since the Unix epoch
/// BigDecimal: u16 BE length + ASCII decimal string
/// Message   : u32 BE length + nested fields
/// ```
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueType {
    String = 1,
    U32 = 2,
    U64 = 3,
    I32 = 4,
    I64 = 5,
    Bool = 6,
    Timestamp = 7,
    BigDecimal = 8,
    Message = 9,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ValueType::String),
            2 => Some(ValueType::U32),
            3 => Some(ValueType::U64),
            4 => Some(ValueType::I32),
            5 => Some(ValueType::I64),
            6 => Some(ValueType::Bool),
            7 => Some(ValueType::Timestamp),
            8 => Some(ValueType::BigDecimal),
            9 => Some(ValueType::Message),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::U32 => "uint32",
            ValueType::U64 => "uint64",
            ValueType::I32 => "int32",
            ValueType::I64 => "int64",
            ValueType::Bool => "bool",
            ValueType::Timestamp => "timestamp",
            ValueType::BigDecimal => "big_decimal",
            ValueType::Message => "message",
        }
    }
}

// Field tags are stable: new fields get new tags, old tags are never reused.

pub mod order_fields {
    pub const ID: u16 = 1;
    pub const MARKET_ID: u16 = 2;
    pub const OWNER_ID: u16 = 3;
    pub const SUB_ACCOUNT_ID: u16 = 4;
    pub const SIDE: u16 = 5;
    pub const ORDER_TYPE: u16 = 6;
    pub const STOP: u16 = 7;
    pub const PRICE: u16 = 8;
    pub const STOP_PRICE: u16 = 9;
    pub const AMOUNT: u16 = 10;
    pub const FUNDS: u16 = 11;
    pub const STATUS: u16 = 12;
    pub const LOCKED_FUNDS: u16 = 13;
    pub const USED_FUNDS: u16 = 14;
    pub const FILLED_AMOUNT: u16 = 15;
    pub const FILLED_QUOTE: u16 = 16;
    pub const FEE_AMOUNT: u16 = 17;
    pub const MAKER_FEE_RATE: u16 = 18;
    pub const TAKER_FEE_RATE: u16 = 19;
    pub const TP_PRICE: u16 = 20;
    pub const TP_AMOUNT: u16 = 21;
    pub const TP_STATUS: u16 = 22;
    pub const TP_ORDER_ID: u16 = 23;
    pub const SL_PRICE: u16 = 24;
    pub const SL_AMOUNT: u16 = 25;
    pub const SL_STATUS: u16 = 26;
    pub const SL_ORDER_ID: u16 = 27;
    pub const PARENT_ORDER_ID: u16 = 28;
    pub const INIT_ORDER_ID: u16 = 29;
    pub const OTO_TYPE: u16 = 30;
    pub const OPPOSITE_LOCKED_FUNDS: u16 = 31;
    pub const TS_ACTIVATION_PRICE: u16 = 32;
    pub const TS_PRICE: u16 = 33;
    pub const TS_PRICE_TYPE: u16 = 34;
    pub const TS_REFERENCE_PRICE: u16 = 35;
    pub const CREATED_AT: u16 = 36;
}

pub mod trade_fields {
    pub const ID: u16 = 1;
    pub const SEQ_ID: u16 = 2;
    pub const MARKET_ID: u16 = 3;
    pub const ASK_ORDER_ID: u16 = 4;
    pub const ASK_OWNER_ID: u16 = 5;
    pub const ASK_SUB_ACCOUNT_ID: u16 = 6;
    pub const BID_ORDER_ID: u16 = 7;
    pub const BID_OWNER_ID: u16 = 8;
    pub const BID_SUB_ACCOUNT_ID: u16 = 9;
    pub const VOLUME: u16 = 10;
    pub const QUOTE_VOLUME: u16 = 11;
    pub const PRICE: u16 = 12;
    pub const ASK_FEE_AMOUNT: u16 = 13;
    pub const BID_FEE_AMOUNT: u16 = 14;
    pub const TAKER_SIDE: u16 = 15;
    pub const SELF_TRADE: u16 = 16;
    pub const CREATED_AT: u16 = 17;
}

pub mod new_trade_fields {
    pub const TRADE: u16 = 1;
    pub const ASK_ORDER: u16 = 2;
    pub const BID_ORDER: u16 = 3;
}

pub mod error_fields {
    pub const CODE: u16 = 1;
    pub const ORDER_ID: u16 = 2;
    pub const OWNER_ID: u16 = 3;
    pub const MESSAGE: u16 = 4;
}

/// Event header tags, then one body tag per union variant.
pub mod event_fields {
    pub const SEQ_ID: u16 = 1;
    pub const CREATED_AT: u16 = 2;
    pub const MARKET_ID: u16 = 3;

    pub const ORDER_STATUS_CHANGE: u16 = 10;
    pub const ORDER_ACTIVATION: u16 = 11;
    pub const NEW_TRADE: u16 = 12;
    pub const ERROR: u16 = 13;
}

pub mod command_fields {
    pub const EVENT_TYPE: u16 = 1;
    pub const ORDER: u16 = 2;
}

pub mod ingress_fields {
    pub const ORDER: u16 = 1;
    pub const MARKET_ID: u16 = 2;
    pub const ORDER_ID: u16 = 3;
    pub const OWNER_ID: u16 = 4;
    pub const USER_ID: u16 = 5;
    pub const SUB_ACCOUNT_ID: u16 = 6;
    pub const OP_KIND: u16 = 7;
    pub const COIN: u16 = 8;
    pub const AMOUNT: u16 = 9;
    pub const FEE: u16 = 10;
    pub const CODE: u16 = 11;
    pub const MESSAGE: u16 = 12;
    pub const OUTCOME: u16 = 13;
    /// Repeated: one nested message per balance row.
    pub const BALANCE: u16 = 14;
    pub const AVAILABLE: u16 = 15;
    pub const LOCKED: u16 = 16;
    pub const IN_ORDERS: u16 = 17;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_types_round_trip_through_u8() {
        for t in [
            WireMessageType::Event,
            WireMessageType::Command,
            WireMessageType::SubmitOrder,
            WireMessageType::CancelOrder,
            WireMessageType::GetBalances,
            WireMessageType::BalanceOp,
            WireMessageType::Accepted,
            WireMessageType::Rejected,
            WireMessageType::CancelResult,
            WireMessageType::Balances,
        ] {
            assert_eq!(WireMessageType::from_u8(t as u8), Some(t));
        }
        assert_eq!(WireMessageType::from_u8(0), None);
        assert_eq!(ValueType::from_u8(10), None);
    }

    #[test]
    fn symbol_limits() {
        assert!(!validate_symbol_len(0));
        assert!(validate_symbol_len(7));
        assert!(!validate_symbol_len(MAX_SYMBOL_LEN + 1));
    }
}
