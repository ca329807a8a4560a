//! Request/response frames for the command ingress.
//!
//! ```text
//! SubmitOrder (20):   1 order message(Order)
//! CancelOrder (21):   2 market_id, 3 order_id, 4 owner_id
//! GetBalances (22):   5 user_id, 6 sub_account_id
//! BalanceOp   (23):   7 op_kind, 5 user_id, 6 sub_account_id, 8 coin, 9 amount, 10 fee
//!
//! Accepted     (30):  3 order_id
//! Rejected     (31):  11 code, 3 order_id, 12 message
//! CancelResult (32):  3 order_id, 13 outcome
//! Balances     (33):  5 user_id, 6 sub_account_id,
//!                     14 balance (repeated message: 8 coin, 15 available, 16 locked, 17 in_orders)
//! ```
//!
//! Every request is answered by exactly one response.

use bytes::BytesMut;
use engine_core::{CancelOutcome, Decimal, ErrorCode, Order};

use crate::binary_codec::{put_header, read_order, split_header, write_order};
use crate::error::ProtocolError;
use crate::fields::{FieldReader, FieldWriter};
use crate::wire_types::{ingress_fields as f, WireMessageType};

/// Kind of an external balance mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BalanceOpKind {
    NewDeposit,
    ConfirmDeposit,
    NewManualWithdraw,
    NewWithdraw,
    ConfirmWithdraw,
    RevertWithdraw,
}

impl BalanceOpKind {
    pub fn as_u8(self) -> u8 {
        match self {
            BalanceOpKind::NewDeposit => 0,
            BalanceOpKind::ConfirmDeposit => 1,
            BalanceOpKind::NewManualWithdraw => 2,
            BalanceOpKind::NewWithdraw => 3,
            BalanceOpKind::ConfirmWithdraw => 4,
            BalanceOpKind::RevertWithdraw => 5,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BalanceOpKind::NewDeposit),
            1 => Some(BalanceOpKind::ConfirmDeposit),
            2 => Some(BalanceOpKind::NewManualWithdraw),
            3 => Some(BalanceOpKind::NewWithdraw),
            4 => Some(BalanceOpKind::ConfirmWithdraw),
            5 => Some(BalanceOpKind::RevertWithdraw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceOp {
    pub kind: BalanceOpKind,
    pub user_id: u64,
    pub sub_account_id: u64,
    pub coin: String,
    pub amount: Decimal,
    /// Only meaningful for `NewWithdraw` and `RevertWithdraw`.
    pub fee: Decimal,
}

/// One coin row of a balance snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceEntry {
    pub coin: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub in_orders: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SubmitOrder(Order),
    CancelOrder {
        market_id: String,
        order_id: u64,
        owner_id: u64,
    },
    GetBalances {
        user_id: u64,
        sub_account_id: u64,
    },
    BalanceOp(BalanceOp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `order_id` is zero for balance operations.
    Accepted { order_id: u64 },
    Rejected {
        code: ErrorCode,
        order_id: u64,
        message: String,
    },
    CancelResult {
        order_id: u64,
        outcome: CancelOutcome,
    },
    Balances {
        user_id: u64,
        sub_account_id: u64,
        balances: Vec<BalanceEntry>,
    },
}

// ============================================================================
// Requests
// ============================================================================

pub fn encode_request(req: &Request, out: &mut BytesMut) -> Result<(), ProtocolError> {
    match req {
        Request::SubmitOrder(order) => {
            put_header(out, WireMessageType::SubmitOrder);
            FieldWriter::new(out).message(f::ORDER, |m| write_order(m, order))
        }
        Request::CancelOrder {
            market_id,
            order_id,
            owner_id,
        } => {
            put_header(out, WireMessageType::CancelOrder);
            let mut w = FieldWriter::new(out);
            w.string(f::MARKET_ID, market_id)?;
            w.u64(f::ORDER_ID, *order_id);
            w.u64(f::OWNER_ID, *owner_id);
            Ok(())
        }
        Request::GetBalances {
            user_id,
            sub_account_id,
        } => {
            put_header(out, WireMessageType::GetBalances);
            let mut w = FieldWriter::new(out);
            w.u64(f::USER_ID, *user_id);
            w.u64(f::SUB_ACCOUNT_ID, *sub_account_id);
            Ok(())
        }
        Request::BalanceOp(op) => {
            put_header(out, WireMessageType::BalanceOp);
            let mut w = FieldWriter::new(out);
            w.u32(f::OP_KIND, op.kind.as_u8().into());
            w.u64(f::USER_ID, op.user_id);
            w.u64(f::SUB_ACCOUNT_ID, op.sub_account_id);
            w.string(f::COIN, &op.coin)?;
            w.decimal(f::AMOUNT, op.amount)?;
            w.decimal(f::FEE, op.fee)
        }
    }
}

/// Flat scratch record for decoding; each message reads the fields it needs.
#[derive(Default)]
struct Scratch {
    order: Option<Order>,
    market_id: Option<String>,
    order_id: u64,
    owner_id: u64,
    user_id: Option<u64>,
    sub_account_id: u64,
    op_kind: Option<BalanceOpKind>,
    coin: Option<String>,
    amount: Option<Decimal>,
    fee: Decimal,
    code: Option<ErrorCode>,
    message: String,
    outcome: Option<CancelOutcome>,
    balances: Vec<BalanceEntry>,
}

fn read_scratch(body: &[u8]) -> Result<Scratch, ProtocolError> {
    let mut s = Scratch::default();
    let mut r = FieldReader::new(body);

    while let Some((tag, v)) = r.next_field()? {
        match tag {
            f::ORDER => s.order = Some(read_order(v.as_message(tag)?)?),
            f::MARKET_ID => s.market_id = Some(v.as_string(tag)?),
            f::ORDER_ID => s.order_id = v.as_u64(tag)?,
            f::OWNER_ID => s.owner_id = v.as_u64(tag)?,
            f::USER_ID => s.user_id = Some(v.as_u64(tag)?),
            f::SUB_ACCOUNT_ID => s.sub_account_id = v.as_u64(tag)?,
            f::OP_KIND => s.op_kind = Some(v.as_enum(tag, "op_kind", BalanceOpKind::from_u8)?),
            f::COIN => s.coin = Some(v.as_string(tag)?),
            f::AMOUNT => s.amount = Some(v.as_decimal(tag)?),
            f::FEE => s.fee = v.as_decimal(tag)?,
            f::CODE => {
                let raw = v.as_u32(tag)?;
                s.code = Some(ErrorCode::from_u32(raw).ok_or(ProtocolError::InvalidField("code"))?);
            }
            f::MESSAGE => s.message = v.as_string(tag)?,
            f::OUTCOME => s.outcome = Some(v.as_enum(tag, "outcome", CancelOutcome::from_u8)?),
            f::BALANCE => s.balances.push(read_balance_entry(v.as_message(tag)?)?),
            _ => {}
        }
    }

    Ok(s)
}

fn read_balance_entry(buf: &[u8]) -> Result<BalanceEntry, ProtocolError> {
    let mut entry = BalanceEntry {
        coin: String::new(),
        available: Decimal::ZERO,
        locked: Decimal::ZERO,
        in_orders: Decimal::ZERO,
    };
    let mut r = FieldReader::new(buf);
    while let Some((tag, v)) = r.next_field()? {
        match tag {
            f::COIN => entry.coin = v.as_string(tag)?,
            f::AVAILABLE => entry.available = v.as_decimal(tag)?,
            f::LOCKED => entry.locked = v.as_decimal(tag)?,
            f::IN_ORDERS => entry.in_orders = v.as_decimal(tag)?,
            _ => {}
        }
    }
    if entry.coin.is_empty() {
        return Err(ProtocolError::MissingField("balance.coin"));
    }
    Ok(entry)
}

pub fn decode_request(buf: &[u8]) -> Result<Request, ProtocolError> {
    let (msg_type, body) = split_header(buf)?;
    let s = read_scratch(body)?;

    match msg_type {
        WireMessageType::SubmitOrder => Ok(Request::SubmitOrder(
            s.order.ok_or(ProtocolError::MissingField("order"))?,
        )),
        WireMessageType::CancelOrder => Ok(Request::CancelOrder {
            market_id: s.market_id.ok_or(ProtocolError::MissingField("market_id"))?,
            order_id: s.order_id,
            owner_id: s.owner_id,
        }),
        WireMessageType::GetBalances => Ok(Request::GetBalances {
            user_id: s.user_id.ok_or(ProtocolError::MissingField("user_id"))?,
            sub_account_id: s.sub_account_id,
        }),
        WireMessageType::BalanceOp => Ok(Request::BalanceOp(BalanceOp {
            kind: s.op_kind.ok_or(ProtocolError::MissingField("op_kind"))?,
            user_id: s.user_id.ok_or(ProtocolError::MissingField("user_id"))?,
            sub_account_id: s.sub_account_id,
            coin: s.coin.ok_or(ProtocolError::MissingField("coin"))?,
            amount: s.amount.ok_or(ProtocolError::MissingField("amount"))?,
            fee: s.fee,
        })),
        other => Err(ProtocolError::UnexpectedMessageType(other as u8)),
    }
}

// ============================================================================
// Responses
// ============================================================================

pub fn encode_response(resp: &Response, out: &mut BytesMut) -> Result<(), ProtocolError> {
    match resp {
        Response::Accepted { order_id } => {
            put_header(out, WireMessageType::Accepted);
            FieldWriter::new(out).u64(f::ORDER_ID, *order_id);
            Ok(())
        }
        Response::Rejected {
            code,
            order_id,
            message,
        } => {
            put_header(out, WireMessageType::Rejected);
            let mut w = FieldWriter::new(out);
            w.u32(f::CODE, code.as_u32());
            w.u64(f::ORDER_ID, *order_id);
            w.string(f::MESSAGE, message)
        }
        Response::CancelResult { order_id, outcome } => {
            put_header(out, WireMessageType::CancelResult);
            let mut w = FieldWriter::new(out);
            w.u64(f::ORDER_ID, *order_id);
            w.u32(f::OUTCOME, outcome.as_u8().into());
            Ok(())
        }
        Response::Balances {
            user_id,
            sub_account_id,
            balances,
        } => {
            put_header(out, WireMessageType::Balances);
            let mut w = FieldWriter::new(out);
            w.u64(f::USER_ID, *user_id);
            w.u64(f::SUB_ACCOUNT_ID, *sub_account_id);
            for b in balances {
                w.message(f::BALANCE, |m| {
                    m.string(f::COIN, &b.coin)?;
                    m.decimal(f::AVAILABLE, b.available)?;
                    m.decimal(f::LOCKED, b.locked)?;
                    m.decimal(f::IN_ORDERS, b.in_orders)
                })?;
            }
            Ok(())
        }
    }
}

pub fn decode_response(buf: &[u8]) -> Result<Response, ProtocolError> {
    let (msg_type, body) = split_header(buf)?;
    let s = read_scratch(body)?;

    match msg_type {
        WireMessageType::Accepted => Ok(Response::Accepted { order_id: s.order_id }),
        WireMessageType::Rejected => Ok(Response::Rejected {
            code: s.code.ok_or(ProtocolError::MissingField("code"))?,
            order_id: s.order_id,
            message: s.message,
        }),
        WireMessageType::CancelResult => Ok(Response::CancelResult {
            order_id: s.order_id,
            outcome: s.outcome.ok_or(ProtocolError::MissingField("outcome"))?,
        }),
        WireMessageType::Balances => Ok(Response::Balances {
            user_id: s.user_id.ok_or(ProtocolError::MissingField("user_id"))?,
            sub_account_id: s.sub_account_id,
            balances: s.balances,
        }),
        other => Err(ProtocolError::UnexpectedMessageType(other as u8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::{OrderType, Side};
    use rust_decimal_macros::dec;

    fn round_trip_request(req: Request) {
        let mut out = BytesMut::new();
        encode_request(&req, &mut out).unwrap();
        assert_eq!(decode_request(&out).unwrap(), req);
    }

    #[test]
    fn requests_decode_to_what_was_sent() {
        let mut order = Order::new(11, "btcusdt", Side::Buy, OrderType::Market, dec!(0), dec!(0.1));
        order.funds = dec!(3000);
        order.owner_id = 4;
        round_trip_request(Request::SubmitOrder(order));

        round_trip_request(Request::CancelOrder {
            market_id: "btcusdt".into(),
            order_id: 11,
            owner_id: 4,
        });
        round_trip_request(Request::BalanceOp(BalanceOp {
            kind: BalanceOpKind::NewWithdraw,
            user_id: 4,
            sub_account_id: 0,
            coin: "usdt".into(),
            amount: dec!(100),
            fee: dec!(1.5),
        }));
    }

    #[test]
    fn balances_response_keeps_every_row() {
        let resp = Response::Balances {
            user_id: 4,
            sub_account_id: 2,
            balances: vec![
                BalanceEntry {
                    coin: "btc".into(),
                    available: dec!(0.5),
                    locked: dec!(0.25),
                    in_orders: dec!(0.25),
                },
                BalanceEntry {
                    coin: "usdt".into(),
                    available: dec!(40000),
                    locked: dec!(0),
                    in_orders: dec!(0),
                },
            ],
        };
        let mut out = BytesMut::new();
        encode_response(&resp, &mut out).unwrap();
        assert_eq!(decode_response(&out).unwrap(), resp);
    }

    #[test]
    fn rejection_carries_the_code() {
        let resp = Response::Rejected {
            code: ErrorCode::CancelAlreadyInProgress,
            order_id: 3,
            message: "cancel already in progress".into(),
        };
        let mut out = BytesMut::new();
        encode_response(&resp, &mut out).unwrap();
        match decode_response(&out).unwrap() {
            Response::Rejected { code, .. } => assert_eq!(code, ErrorCode::CancelAlreadyInProgress),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn a_response_is_not_a_request() {
        let mut out = BytesMut::new();
        encode_response(&Response::Accepted { order_id: 1 }, &mut out).unwrap();
        assert_eq!(
            decode_request(&out),
            Err(ProtocolError::UnexpectedMessageType(WireMessageType::Accepted as u8))
        );
    }

    #[test]
    fn balance_op_without_amount_is_incomplete() {
        let mut out = BytesMut::new();
        put_header(&mut out, WireMessageType::BalanceOp);
        let mut w = FieldWriter::new(&mut out);
        w.u32(f::OP_KIND, BalanceOpKind::NewDeposit.as_u8().into());
        w.u64(f::USER_ID, 1);
        w.string(f::COIN, "btc").unwrap();
        assert_eq!(decode_request(&out), Err(ProtocolError::MissingField("amount")));
    }
}
