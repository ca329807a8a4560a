//! Order kinds: primitive (limit / market), composite, stop and
//! trailing-stop parameters.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order type.
///
/// `Limit` and `Market` execute directly on the book. The remaining
/// variants are composite orders driven by the state machines in
/// [`composite`](crate::composite).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    Limit,
    Market,
    Oco,
    Oto,
    Strangle,
    Straddle,
    TrailingStop,
}

impl OrderType {
    pub fn is_composite(self) -> bool {
        !matches!(self, OrderType::Limit | OrderType::Market)
    }

    /// Strangle and straddle parents never rest themselves; their two legs
    /// carry the locked funds.
    pub fn is_virtual(self) -> bool {
        matches!(self, OrderType::Strangle | OrderType::Straddle)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OrderType::Limit => 0,
            OrderType::Market => 1,
            OrderType::Oco => 2,
            OrderType::Oto => 3,
            OrderType::Strangle => 4,
            OrderType::Straddle => 5,
            OrderType::TrailingStop => 6,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OrderType::Limit),
            1 => Some(OrderType::Market),
            2 => Some(OrderType::Oco),
            3 => Some(OrderType::Oto),
            4 => Some(OrderType::Strangle),
            5 => Some(OrderType::Straddle),
            6 => Some(OrderType::TrailingStop),
            _ => None,
        }
    }
}

/// Stop trigger direction.
///
/// - `Loss`: triggers when the last trade price is at or below `stop_price`.
/// - `Entry`: triggers when the last trade price is at or above `stop_price`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    #[default]
    None,
    Loss,
    Entry,
}

impl StopType {
    pub fn is_triggered(self, stop_price: Decimal, last_price: Decimal) -> bool {
        match self {
            StopType::None => false,
            StopType::Loss => last_price <= stop_price,
            StopType::Entry => last_price >= stop_price,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            StopType::None => 0,
            StopType::Loss => 1,
            StopType::Entry => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StopType::None),
            1 => Some(StopType::Loss),
            2 => Some(StopType::Entry),
            _ => None,
        }
    }
}

/// How a trailing stop's `ts_price` offset is interpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TsPriceType {
    #[default]
    Percentage,
    Absolute,
}

impl TsPriceType {
    pub fn as_u8(self) -> u8 {
        match self {
            TsPriceType::Percentage => 0,
            TsPriceType::Absolute => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TsPriceType::Percentage),
            1 => Some(TsPriceType::Absolute),
            _ => None,
        }
    }
}

/// Follow-up leg kind of an OTO order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtoType {
    TakeProfit,
    StopLoss,
}

impl OtoType {
    pub fn as_u8(self) -> u8 {
        match self {
            OtoType::TakeProfit => 1,
            OtoType::StopLoss => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(OtoType::TakeProfit),
            2 => Some(OtoType::StopLoss),
            _ => None,
        }
    }
}
