//! Commands consumed and events produced by the matching engine.
//!
//! These are transport-agnostic logical messages; the binary encoding
//! lives in the `engine-protocol` crate.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::order::Order;
use crate::side::Side;
use crate::status::OrderStatus;

/// What an [`OrderCommand`] asks the engine to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    NewOrder,
    CancelOrder,
}

impl CommandType {
    pub fn as_u8(self) -> u8 {
        match self {
            CommandType::NewOrder => 0,
            CommandType::CancelOrder => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CommandType::NewOrder),
            1 => Some(CommandType::CancelOrder),
            _ => None,
        }
    }
}

/// An admitted order command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCommand {
    pub event_type: CommandType,
    pub order: Order,
}

impl OrderCommand {
    pub fn new_order(order: Order) -> Self {
        OrderCommand {
            event_type: CommandType::NewOrder,
            order,
        }
    }

    /// Cancel `order_id`, on behalf of `owner_id`.
    pub fn cancel(market_id: impl Into<String>, order_id: u64, owner_id: u64) -> Self {
        let order = Order {
            id: order_id,
            market_id: market_id.into(),
            owner_id,
            ..Order::default()
        };
        OrderCommand {
            event_type: CommandType::CancelOrder,
            order,
        }
    }
}

/// A single executed match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Equal to `seq_id`: trades are numbered by the market's trade sequence.
    pub id: u64,
    pub seq_id: u64,
    pub market_id: String,

    pub ask_order_id: u64,
    pub ask_owner_id: u64,
    pub ask_sub_account_id: u64,
    pub bid_order_id: u64,
    pub bid_owner_id: u64,
    pub bid_sub_account_id: u64,

    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub price: Decimal,
    /// Paid by the seller, in the quote coin.
    pub ask_fee_amount: Decimal,
    /// Paid by the buyer, in the base coin.
    pub bid_fee_amount: Decimal,

    pub taker_side: Side,
    pub self_trade: bool,
    pub created_at: i64,
}

impl Trade {
    /// Quote credited to the seller.
    pub fn ask_credit(&self) -> Decimal {
        self.quote_volume - self.ask_fee_amount
    }

    /// Base credited to the buyer.
    pub fn bid_credit(&self) -> Decimal {
        self.volume - self.bid_fee_amount
    }
}

/// A trade together with post-trade snapshots of both orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrade {
    pub trade: Trade,
    pub ask_order: Order,
    pub bid_order: Order,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub order_id: u64,
    pub owner_id: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    OrderStatusChange { order: Order },
    OrderActivation { order: Order },
    NewTrade(NewTrade),
    Error(ErrorEvent),
}

/// One entry of a market's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq_id: u64,
    /// Nanoseconds since the Unix epoch.
    pub created_at: i64,
    pub market_id: String,
    pub body: EventBody,
}

impl Event {
    /// Order snapshot carried by status and activation events.
    pub fn order(&self) -> Option<&Order> {
        match &self.body {
            EventBody::OrderStatusChange { order } | EventBody::OrderActivation { order } => Some(order),
            _ => None,
        }
    }

    pub fn trade(&self) -> Option<&NewTrade> {
        match &self.body {
            EventBody::NewTrade(t) => Some(t),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorEvent> {
        match &self.body {
            EventBody::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Every order snapshot in this event, in stream order.
    pub fn order_snapshots(&self) -> Vec<&Order> {
        match &self.body {
            EventBody::OrderStatusChange { order } | EventBody::OrderActivation { order } => vec![order],
            EventBody::NewTrade(t) => vec![&t.ask_order, &t.bid_order],
            EventBody::Error(_) => Vec::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.body {
            EventBody::OrderStatusChange { .. } => "order_status_change",
            EventBody::OrderActivation { .. } => "order_activation",
            EventBody::NewTrade(_) => "new_trade",
            EventBody::Error(_) => "error",
        }
    }
}

/// What a cancel waiter is told once the engine has decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The order was cancelled.
    Ok,
    /// The order filled before the cancel reached the book.
    AlreadyFilled,
    /// The engine answered with `cancel_failed`.
    CancelFailedFromMe,
}

impl CancelOutcome {
    /// The `(order_id, outcome)` this event settles, if any.
    ///
    /// Only terminal status changes and `cancel_failed` errors settle a
    /// waiter; trades and activations never do.
    pub fn from_event(event: &Event) -> Option<(u64, CancelOutcome)> {
        match &event.body {
            EventBody::OrderStatusChange { order } => match order.status {
                OrderStatus::Filled => Some((order.id, CancelOutcome::AlreadyFilled)),
                OrderStatus::Cancelled => Some((order.id, CancelOutcome::Ok)),
                _ => None,
            },
            EventBody::Error(e) if e.code == ErrorCode::CancelFailed => {
                Some((e.order_id, CancelOutcome::CancelFailedFromMe))
            }
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            CancelOutcome::Ok => 0,
            CancelOutcome::AlreadyFilled => 1,
            CancelOutcome::CancelFailedFromMe => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CancelOutcome::Ok),
            1 => Some(CancelOutcome::AlreadyFilled),
            2 => Some(CancelOutcome::CancelFailedFromMe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CancelOutcome::Ok => "ok",
            CancelOutcome::AlreadyFilled => "already_filled",
            CancelOutcome::CancelFailedFromMe => "cancel_failed_from_me",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(id: u64, status: OrderStatus) -> Event {
        let order = Order {
            id,
            status,
            ..Order::default()
        };
        Event {
            seq_id: 1,
            created_at: 0,
            market_id: "btcusdt".into(),
            body: EventBody::OrderStatusChange { order },
        }
    }

    #[test]
    fn terminal_statuses_settle_waiters() {
        assert_eq!(
            CancelOutcome::from_event(&status_event(7, OrderStatus::Cancelled)),
            Some((7, CancelOutcome::Ok))
        );
        assert_eq!(
            CancelOutcome::from_event(&status_event(7, OrderStatus::Filled)),
            Some((7, CancelOutcome::AlreadyFilled))
        );
        assert_eq!(CancelOutcome::from_event(&status_event(7, OrderStatus::PartiallyFilled)), None);
    }

    #[test]
    fn only_cancel_failed_errors_settle_waiters() {
        let mut ev = status_event(0, OrderStatus::Pending);
        ev.body = EventBody::Error(ErrorEvent {
            code: ErrorCode::InvalidOrder,
            order_id: 9,
            owner_id: 1,
            message: String::new(),
        });
        assert_eq!(CancelOutcome::from_event(&ev), None);

        ev.body = EventBody::Error(ErrorEvent {
            code: ErrorCode::CancelFailed,
            order_id: 9,
            owner_id: 1,
            message: String::new(),
        });
        assert_eq!(CancelOutcome::from_event(&ev), Some((9, CancelOutcome::CancelFailedFromMe)));
    }
}
