//! engine-protocol
//!
//! Wire-level encoding/decoding for the trading core.
//!
//! This crate turns logical engine messages (`engine_core::Event`,
//! `engine_core::OrderCommand`) and the ingress request/response frames
//! into bytes and back again.
//!
//! - [`fields`]       : tagged key/value body primitives
//! - [`binary_codec`] : events, commands and stream framing
//! - [`ingress`]      : client ↔ server request/response frames

pub mod wire_types;
pub mod error;
pub mod fields;
pub mod binary_codec;
pub mod ingress;

pub use error::ProtocolError;

pub use binary_codec::{
    decode_command,
    decode_event,
    encode_command,
    encode_event,
    event_to_bytes,
    read_frame,
    write_frame,
};

pub use ingress::{
    decode_request,
    decode_response,
    encode_request,
    encode_response,
    BalanceEntry,
    BalanceOp,
    BalanceOpKind,
    Request,
    Response,
};
