//! Binary encoding/decoding for engine-core messages.
//!
//! This module converts between:
//! - raw binary payloads (`&[u8]`)
//! - `engine_core::Event` and `engine_core::OrderCommand`
//!
//! Framing model:
//!
//! ```text
//! Payload
//! -------
//! [0]   : msg_type (WireMessageType as u8)
//! [1]   : version  (PROTOCOL_VERSION)
//! [2..4]: reserved = 0
//! [4..] : tagged fields (see `fields`)
//!
//! Event (type=1):
//!   1  seq_id      uint64
//!   2  created_at  timestamp
//!   3  market_id   string
//!   exactly one of
//!   10 order_status_change  message(Order)
//!   11 order_activation     message(Order)
//!   12 new_trade            message(NewTrade)
//!   13 error                message(ErrorEvent)
//!
//! Command (type=2):
//!   1  event_type  uint32 (0=new_order, 1=cancel_order)
//!   2  order       message(Order)
//!
//! Stream frame
//! ------------
//! [0..4] : payload length (u32 BE)
//! [4..]  : payload
//! ```
//!
//! Stores and publishers keep bare payloads; TCP streams carry frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use engine_core::{
    CommandType, ErrorCode, ErrorEvent, Event, EventBody, NewTrade, Order, OrderCommand, OrderStatus, OrderType,
    OtoType, Side, StopType, Trade, TsPriceType,
};

use crate::error::ProtocolError;
use crate::fields::{FieldReader, FieldWriter};
use crate::wire_types::{
    command_fields, error_fields, event_fields, new_trade_fields, order_fields, trade_fields, WireMessageType,
    HEADER_LEN, MAX_FRAME_LEN, PROTOCOL_VERSION,
};

// ============================================================================
// Header
// ============================================================================

pub(crate) fn put_header(out: &mut BytesMut, msg_type: WireMessageType) {
    out.put_u8(msg_type as u8);
    out.put_u8(PROTOCOL_VERSION);
    out.put_slice(&[0, 0]); // reserved
}

/// Checks version and type, returning the message type and its body.
pub(crate) fn split_header(buf: &[u8]) -> Result<(WireMessageType, &[u8]), ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated);
    }

    let msg_type = buf[0];
    let version = buf[1];

    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(version));
    }

    let wire_type = WireMessageType::from_u8(msg_type).ok_or(ProtocolError::UnknownMessageType(msg_type))?;
    Ok((wire_type, &buf[HEADER_LEN..]))
}

fn expect_header(buf: &[u8], expected: WireMessageType) -> Result<&[u8], ProtocolError> {
    let (found, body) = split_header(buf)?;
    if found != expected {
        return Err(ProtocolError::UnexpectedMessageType(found as u8));
    }
    Ok(body)
}

// ============================================================================
// Order
// ============================================================================

pub fn write_order(w: &mut FieldWriter<'_>, o: &Order) -> Result<(), ProtocolError> {
    use order_fields as f;

    w.u64(f::ID, o.id);
    w.string(f::MARKET_ID, &o.market_id)?;
    w.u64(f::OWNER_ID, o.owner_id);
    w.u64(f::SUB_ACCOUNT_ID, o.sub_account_id);

    w.u32(f::SIDE, o.side.as_u8().into());
    w.u32(f::ORDER_TYPE, o.order_type.as_u8().into());
    w.u32(f::STOP, o.stop.as_u8().into());
    w.decimal(f::PRICE, o.price)?;
    w.decimal(f::STOP_PRICE, o.stop_price)?;
    w.decimal(f::AMOUNT, o.amount)?;
    w.decimal(f::FUNDS, o.funds)?;

    w.u32(f::STATUS, o.status.as_u8().into());
    w.decimal(f::LOCKED_FUNDS, o.locked_funds)?;
    w.decimal(f::USED_FUNDS, o.used_funds)?;
    w.decimal(f::FILLED_AMOUNT, o.filled_amount)?;
    w.decimal(f::FILLED_QUOTE, o.filled_quote)?;
    w.decimal(f::FEE_AMOUNT, o.fee_amount)?;
    w.decimal(f::MAKER_FEE_RATE, o.maker_fee_rate)?;
    w.decimal(f::TAKER_FEE_RATE, o.taker_fee_rate)?;

    // Composite fields are mostly zero; skip them for plain orders.
    if o.order_type.is_composite() || o.parent_order_id != 0 || o.init_order_id != 0 {
        w.decimal(f::TP_PRICE, o.tp_price)?;
        w.decimal(f::TP_AMOUNT, o.tp_amount)?;
        w.u32(f::TP_STATUS, o.tp_status.as_u8().into());
        w.u64(f::TP_ORDER_ID, o.tp_order_id);
        w.decimal(f::SL_PRICE, o.sl_price)?;
        w.decimal(f::SL_AMOUNT, o.sl_amount)?;
        w.u32(f::SL_STATUS, o.sl_status.as_u8().into());
        w.u64(f::SL_ORDER_ID, o.sl_order_id);
        w.u64(f::PARENT_ORDER_ID, o.parent_order_id);
        w.u64(f::INIT_ORDER_ID, o.init_order_id);
        if let Some(t) = o.oto_type {
            w.u32(f::OTO_TYPE, t.as_u8().into());
        }
        w.decimal(f::OPPOSITE_LOCKED_FUNDS, o.opposite_locked_funds)?;
    }

    if o.order_type == OrderType::TrailingStop {
        w.decimal(f::TS_ACTIVATION_PRICE, o.ts_activation_price)?;
        w.decimal(f::TS_PRICE, o.ts_price)?;
        w.u32(f::TS_PRICE_TYPE, o.ts_price_type.as_u8().into());
        w.decimal(f::TS_REFERENCE_PRICE, o.ts_reference_price)?;
    }

    w.timestamp(f::CREATED_AT, o.created_at);
    Ok(())
}

/// Missing fields keep their `Order::default()` value.
pub fn read_order(buf: &[u8]) -> Result<Order, ProtocolError> {
    use order_fields as f;

    let mut o = Order::default();
    let mut r = FieldReader::new(buf);

    while let Some((tag, v)) = r.next_field()? {
        match tag {
            f::ID => o.id = v.as_u64(tag)?,
            f::MARKET_ID => o.market_id = v.as_string(tag)?,
            f::OWNER_ID => o.owner_id = v.as_u64(tag)?,
            f::SUB_ACCOUNT_ID => o.sub_account_id = v.as_u64(tag)?,
            f::SIDE => o.side = v.as_enum(tag, "side", Side::from_u8)?,
            f::ORDER_TYPE => o.order_type = v.as_enum(tag, "order_type", OrderType::from_u8)?,
            f::STOP => o.stop = v.as_enum(tag, "stop", StopType::from_u8)?,
            f::PRICE => o.price = v.as_decimal(tag)?,
            f::STOP_PRICE => o.stop_price = v.as_decimal(tag)?,
            f::AMOUNT => o.amount = v.as_decimal(tag)?,
            f::FUNDS => o.funds = v.as_decimal(tag)?,
            f::STATUS => o.status = v.as_enum(tag, "status", OrderStatus::from_u8)?,
            f::LOCKED_FUNDS => o.locked_funds = v.as_decimal(tag)?,
            f::USED_FUNDS => o.used_funds = v.as_decimal(tag)?,
            f::FILLED_AMOUNT => o.filled_amount = v.as_decimal(tag)?,
            f::FILLED_QUOTE => o.filled_quote = v.as_decimal(tag)?,
            f::FEE_AMOUNT => o.fee_amount = v.as_decimal(tag)?,
            f::MAKER_FEE_RATE => o.maker_fee_rate = v.as_decimal(tag)?,
            f::TAKER_FEE_RATE => o.taker_fee_rate = v.as_decimal(tag)?,
            f::TP_PRICE => o.tp_price = v.as_decimal(tag)?,
            f::TP_AMOUNT => o.tp_amount = v.as_decimal(tag)?,
            f::TP_STATUS => o.tp_status = v.as_enum(tag, "tp_status", OrderStatus::from_u8)?,
            f::TP_ORDER_ID => o.tp_order_id = v.as_u64(tag)?,
            f::SL_PRICE => o.sl_price = v.as_decimal(tag)?,
            f::SL_AMOUNT => o.sl_amount = v.as_decimal(tag)?,
            f::SL_STATUS => o.sl_status = v.as_enum(tag, "sl_status", OrderStatus::from_u8)?,
            f::SL_ORDER_ID => o.sl_order_id = v.as_u64(tag)?,
            f::PARENT_ORDER_ID => o.parent_order_id = v.as_u64(tag)?,
            f::INIT_ORDER_ID => o.init_order_id = v.as_u64(tag)?,
            f::OTO_TYPE => o.oto_type = Some(v.as_enum(tag, "oto_type", OtoType::from_u8)?),
            f::OPPOSITE_LOCKED_FUNDS => o.opposite_locked_funds = v.as_decimal(tag)?,
            f::TS_ACTIVATION_PRICE => o.ts_activation_price = v.as_decimal(tag)?,
            f::TS_PRICE => o.ts_price = v.as_decimal(tag)?,
            f::TS_PRICE_TYPE => o.ts_price_type = v.as_enum(tag, "ts_price_type", TsPriceType::from_u8)?,
            f::TS_REFERENCE_PRICE => o.ts_reference_price = v.as_decimal(tag)?,
            f::CREATED_AT => o.created_at = v.as_timestamp(tag)?,
            _ => {}
        }
    }

    Ok(o)
}

// ============================================================================
// Trade / NewTrade / ErrorEvent
// ============================================================================

fn write_trade(w: &mut FieldWriter<'_>, t: &Trade) -> Result<(), ProtocolError> {
    use trade_fields as f;

    w.u64(f::ID, t.id);
    w.u64(f::SEQ_ID, t.seq_id);
    w.string(f::MARKET_ID, &t.market_id)?;
    w.u64(f::ASK_ORDER_ID, t.ask_order_id);
    w.u64(f::ASK_OWNER_ID, t.ask_owner_id);
    w.u64(f::ASK_SUB_ACCOUNT_ID, t.ask_sub_account_id);
    w.u64(f::BID_ORDER_ID, t.bid_order_id);
    w.u64(f::BID_OWNER_ID, t.bid_owner_id);
    w.u64(f::BID_SUB_ACCOUNT_ID, t.bid_sub_account_id);
    w.decimal(f::VOLUME, t.volume)?;
    w.decimal(f::QUOTE_VOLUME, t.quote_volume)?;
    w.decimal(f::PRICE, t.price)?;
    w.decimal(f::ASK_FEE_AMOUNT, t.ask_fee_amount)?;
    w.decimal(f::BID_FEE_AMOUNT, t.bid_fee_amount)?;
    w.u32(f::TAKER_SIDE, t.taker_side.as_u8().into());
    w.bool(f::SELF_TRADE, t.self_trade);
    w.timestamp(f::CREATED_AT, t.created_at);
    Ok(())
}

fn read_trade(buf: &[u8]) -> Result<Trade, ProtocolError> {
    use trade_fields as f;

    let mut t = Trade {
        id: 0,
        seq_id: 0,
        market_id: String::new(),
        ask_order_id: 0,
        ask_owner_id: 0,
        ask_sub_account_id: 0,
        bid_order_id: 0,
        bid_owner_id: 0,
        bid_sub_account_id: 0,
        volume: Default::default(),
        quote_volume: Default::default(),
        price: Default::default(),
        ask_fee_amount: Default::default(),
        bid_fee_amount: Default::default(),
        taker_side: Side::Buy,
        self_trade: false,
        created_at: 0,
    };

    let mut r = FieldReader::new(buf);
    while let Some((tag, v)) = r.next_field()? {
        match tag {
            f::ID => t.id = v.as_u64(tag)?,
            f::SEQ_ID => t.seq_id = v.as_u64(tag)?,
            f::MARKET_ID => t.market_id = v.as_string(tag)?,
            f::ASK_ORDER_ID => t.ask_order_id = v.as_u64(tag)?,
            f::ASK_OWNER_ID => t.ask_owner_id = v.as_u64(tag)?,
            f::ASK_SUB_ACCOUNT_ID => t.ask_sub_account_id = v.as_u64(tag)?,
            f::BID_ORDER_ID => t.bid_order_id = v.as_u64(tag)?,
            f::BID_OWNER_ID => t.bid_owner_id = v.as_u64(tag)?,
            f::BID_SUB_ACCOUNT_ID => t.bid_sub_account_id = v.as_u64(tag)?,
            f::VOLUME => t.volume = v.as_decimal(tag)?,
            f::QUOTE_VOLUME => t.quote_volume = v.as_decimal(tag)?,
            f::PRICE => t.price = v.as_decimal(tag)?,
            f::ASK_FEE_AMOUNT => t.ask_fee_amount = v.as_decimal(tag)?,
            f::BID_FEE_AMOUNT => t.bid_fee_amount = v.as_decimal(tag)?,
            f::TAKER_SIDE => t.taker_side = v.as_enum(tag, "taker_side", Side::from_u8)?,
            f::SELF_TRADE => t.self_trade = v.as_bool(tag)?,
            f::CREATED_AT => t.created_at = v.as_timestamp(tag)?,
            _ => {}
        }
    }

    if t.seq_id == 0 {
        return Err(ProtocolError::MissingField("trade.seq_id"));
    }
    Ok(t)
}

fn write_new_trade(w: &mut FieldWriter<'_>, nt: &NewTrade) -> Result<(), ProtocolError> {
    w.message(new_trade_fields::TRADE, |m| write_trade(m, &nt.trade))?;
    w.message(new_trade_fields::ASK_ORDER, |m| write_order(m, &nt.ask_order))?;
    w.message(new_trade_fields::BID_ORDER, |m| write_order(m, &nt.bid_order))
}

fn read_new_trade(buf: &[u8]) -> Result<NewTrade, ProtocolError> {
    let mut trade = None;
    let mut ask_order = None;
    let mut bid_order = None;

    let mut r = FieldReader::new(buf);
    while let Some((tag, v)) = r.next_field()? {
        match tag {
            new_trade_fields::TRADE => trade = Some(read_trade(v.as_message(tag)?)?),
            new_trade_fields::ASK_ORDER => ask_order = Some(read_order(v.as_message(tag)?)?),
            new_trade_fields::BID_ORDER => bid_order = Some(read_order(v.as_message(tag)?)?),
            _ => {}
        }
    }

    Ok(NewTrade {
        trade: trade.ok_or(ProtocolError::MissingField("new_trade.trade"))?,
        ask_order: ask_order.ok_or(ProtocolError::MissingField("new_trade.ask_order"))?,
        bid_order: bid_order.ok_or(ProtocolError::MissingField("new_trade.bid_order"))?,
    })
}

fn write_error(w: &mut FieldWriter<'_>, e: &ErrorEvent) -> Result<(), ProtocolError> {
    w.u32(error_fields::CODE, e.code.as_u32());
    w.u64(error_fields::ORDER_ID, e.order_id);
    w.u64(error_fields::OWNER_ID, e.owner_id);
    w.string(error_fields::MESSAGE, &e.message)
}

fn read_error(buf: &[u8]) -> Result<ErrorEvent, ProtocolError> {
    let mut code = None;
    let mut order_id = 0;
    let mut owner_id = 0;
    let mut message = String::new();

    let mut r = FieldReader::new(buf);
    while let Some((tag, v)) = r.next_field()? {
        match tag {
            error_fields::CODE => {
                let raw = v.as_u32(tag)?;
                code = Some(ErrorCode::from_u32(raw).ok_or(ProtocolError::InvalidField("error.code"))?);
            }
            error_fields::ORDER_ID => order_id = v.as_u64(tag)?,
            error_fields::OWNER_ID => owner_id = v.as_u64(tag)?,
            error_fields::MESSAGE => message = v.as_string(tag)?,
            _ => {}
        }
    }

    Ok(ErrorEvent {
        code: code.ok_or(ProtocolError::MissingField("error.code"))?,
        order_id,
        owner_id,
        message,
    })
}

// ============================================================================
// Event
// ============================================================================

/// Encode one event payload, appending to `out`.
pub fn encode_event(ev: &Event, out: &mut BytesMut) -> Result<(), ProtocolError> {
    use event_fields as f;

    put_header(out, WireMessageType::Event);
    let mut w = FieldWriter::new(out);

    w.u64(f::SEQ_ID, ev.seq_id);
    w.timestamp(f::CREATED_AT, ev.created_at);
    w.string(f::MARKET_ID, &ev.market_id)?;

    match &ev.body {
        EventBody::OrderStatusChange { order } => w.message(f::ORDER_STATUS_CHANGE, |m| write_order(m, order)),
        EventBody::OrderActivation { order } => w.message(f::ORDER_ACTIVATION, |m| write_order(m, order)),
        EventBody::NewTrade(nt) => w.message(f::NEW_TRADE, |m| write_new_trade(m, nt)),
        EventBody::Error(e) => w.message(f::ERROR, |m| write_error(m, e)),
    }
}

/// Encode one event into a standalone payload.
pub fn event_to_bytes(ev: &Event) -> Result<Bytes, ProtocolError> {
    let mut out = BytesMut::with_capacity(256);
    encode_event(ev, &mut out)?;
    Ok(out.freeze())
}

/// Decode one event payload.
pub fn decode_event(buf: &[u8]) -> Result<Event, ProtocolError> {
    use event_fields as f;

    let body_buf = expect_header(buf, WireMessageType::Event)?;

    let mut seq_id = None;
    let mut created_at = 0;
    let mut market_id = String::new();
    let mut body = None;

    let mut r = FieldReader::new(body_buf);
    while let Some((tag, v)) = r.next_field()? {
        let decoded = match tag {
            f::SEQ_ID => {
                seq_id = Some(v.as_u64(tag)?);
                None
            }
            f::CREATED_AT => {
                created_at = v.as_timestamp(tag)?;
                None
            }
            f::MARKET_ID => {
                market_id = v.as_string(tag)?;
                None
            }
            f::ORDER_STATUS_CHANGE => Some(EventBody::OrderStatusChange {
                order: read_order(v.as_message(tag)?)?,
            }),
            f::ORDER_ACTIVATION => Some(EventBody::OrderActivation {
                order: read_order(v.as_message(tag)?)?,
            }),
            f::NEW_TRADE => Some(EventBody::NewTrade(read_new_trade(v.as_message(tag)?)?)),
            f::ERROR => Some(EventBody::Error(read_error(v.as_message(tag)?)?)),
            _ => None,
        };

        if let Some(decoded) = decoded {
            if body.replace(decoded).is_some() {
                return Err(ProtocolError::InvalidField("event.body"));
            }
        }
    }

    Ok(Event {
        seq_id: seq_id.ok_or(ProtocolError::MissingField("event.seq_id"))?,
        created_at,
        market_id,
        body: body.ok_or(ProtocolError::MissingField("event.body"))?,
    })
}

// ============================================================================
// OrderCommand
// ============================================================================

pub fn encode_command(cmd: &OrderCommand, out: &mut BytesMut) -> Result<(), ProtocolError> {
    put_header(out, WireMessageType::Command);
    let mut w = FieldWriter::new(out);
    w.u32(command_fields::EVENT_TYPE, cmd.event_type.as_u8().into());
    w.message(command_fields::ORDER, |m| write_order(m, &cmd.order))
}

pub fn decode_command(buf: &[u8]) -> Result<OrderCommand, ProtocolError> {
    let body_buf = expect_header(buf, WireMessageType::Command)?;

    let mut event_type = None;
    let mut order = None;

    let mut r = FieldReader::new(body_buf);
    while let Some((tag, v)) = r.next_field()? {
        match tag {
            command_fields::EVENT_TYPE => event_type = Some(v.as_enum(tag, "event_type", CommandType::from_u8)?),
            command_fields::ORDER => order = Some(read_order(v.as_message(tag)?)?),
            _ => {}
        }
    }

    Ok(OrderCommand {
        event_type: event_type.ok_or(ProtocolError::MissingField("command.event_type"))?,
        order: order.ok_or(ProtocolError::MissingField("command.order"))?,
    })
}

// ============================================================================
// Stream framing
// ============================================================================

/// Append `payload` to `out` behind a u32 BE length prefix.
pub fn write_frame(payload: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    out.reserve(4 + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    Ok(())
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete; the partial
/// bytes stay in `buf`.
pub fn read_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::{Market, MatchingEngine};
    use rust_decimal_macros::dec;

    fn limit(id: u64, side: Side, price: rust_decimal::Decimal, amount: rust_decimal::Decimal) -> Order {
        let mut o = Order::new(id, "btcusdt", side, OrderType::Limit, price, amount);
        o.owner_id = id;
        o.sub_account_id = 1;
        o.locked_funds = match side {
            Side::Buy => price * amount,
            Side::Sell => amount,
        };
        o
    }

    /// Real events from a small session: status, trade, error.
    fn session() -> Vec<Event> {
        let mut engine = MatchingEngine::new(Market::new("btcusdt", "btc", "usdt", 8, 8));
        let mut events = engine.process_at(OrderCommand::new_order(limit(1, Side::Sell, dec!(20000), dec!(0.5))), 10);
        events.extend(engine.process_at(OrderCommand::new_order(limit(2, Side::Buy, dec!(20000), dec!(0.2))), 11));
        events.extend(engine.process_at(OrderCommand::cancel("btcusdt", 99, 0), 12));
        events
    }

    #[test]
    fn engine_events_survive_the_wire() {
        let events = session();
        assert!(events.iter().any(|e| e.trade().is_some()));
        assert!(events.iter().any(|e| e.error().is_some()));

        for ev in &events {
            let bytes = event_to_bytes(ev).unwrap();
            assert_eq!(&decode_event(&bytes).unwrap(), ev);
        }
    }

    #[test]
    fn composite_fields_are_carried() {
        let mut o = Order::new(5, "btcusdt", Side::Sell, OrderType::Oco, dec!(21000), dec!(1));
        o.stop_price = dec!(19000);
        o.sl_price = dec!(18900);
        o.sl_order_id = 6;
        o.sl_status = OrderStatus::Pending;
        o.oto_type = Some(OtoType::StopLoss);

        let mut out = BytesMut::new();
        encode_command(&OrderCommand::new_order(o.clone()), &mut out).unwrap();
        let back = decode_command(&out).unwrap();
        assert_eq!(back.event_type, CommandType::NewOrder);
        assert_eq!(back.order, o);
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let ev = &session()[0];
        let mut out = BytesMut::new();
        encode_event(ev, &mut out).unwrap();
        // A newer writer appends a field this reader has never heard of.
        FieldWriter::new(&mut out).string(999, "future").unwrap();

        assert_eq!(&decode_event(&out).unwrap(), ev);
    }

    #[test]
    fn header_is_checked() {
        let bytes = event_to_bytes(&session()[0]).unwrap();

        let mut wrong_version = bytes.to_vec();
        wrong_version[1] = PROTOCOL_VERSION + 1;
        assert_eq!(
            decode_event(&wrong_version),
            Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION + 1))
        );

        assert_eq!(
            decode_command(&bytes),
            Err(ProtocolError::UnexpectedMessageType(WireMessageType::Event as u8))
        );
        assert_eq!(decode_event(&bytes[..2]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn event_without_body_is_rejected() {
        let mut out = BytesMut::new();
        put_header(&mut out, WireMessageType::Event);
        FieldWriter::new(&mut out).u64(event_fields::SEQ_ID, 3);
        assert_eq!(decode_event(&out), Err(ProtocolError::MissingField("event.body")));
    }

    #[test]
    fn frames_are_reassembled_from_partial_reads() {
        let a = event_to_bytes(&session()[0]).unwrap();
        let b = event_to_bytes(&session()[1]).unwrap();
        let mut wire = BytesMut::new();
        write_frame(&a, &mut wire).unwrap();
        write_frame(&b, &mut wire).unwrap();

        let mut rx = BytesMut::new();
        rx.extend_from_slice(&wire[..3]);
        assert_eq!(read_frame(&mut rx).unwrap(), None);
        rx.extend_from_slice(&wire[3..a.len() + 2]);
        assert_eq!(read_frame(&mut rx).unwrap(), None);
        rx.extend_from_slice(&wire[a.len() + 2..]);

        assert_eq!(read_frame(&mut rx).unwrap(), Some(a));
        assert_eq!(read_frame(&mut rx).unwrap(), Some(b));
        assert!(rx.is_empty());
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut rx = BytesMut::new();
        rx.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert_eq!(read_frame(&mut rx), Err(ProtocolError::FrameTooLarge(MAX_FRAME_LEN + 1)));
    }
}
