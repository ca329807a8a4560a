//! Order representation shared by the book, the composite tracker, the
//! funds settlement and every persistence layer.
//!
//! The same struct is both the admitted command payload and the engine's
//! live copy: the engine mutates the accounting fields (`status`,
//! `used_funds`, `filled_amount`, ...) and every emitted event carries a
//! snapshot of it.

use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::OrderError;
use crate::market::Market;
use crate::order_type::{OrderType, OtoType, StopType, TsPriceType};
use crate::side::Side;
use crate::status::OrderStatus;

/// Largest price, amount or funds value a command may carry. The product
/// of two such values still fits in a `Decimal`.
pub const MAX_MAGNITUDE: Decimal = Decimal::from_parts(0x107A_4000, 0x5AF3, 0, false, 0);

/// A single order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    // Identity
    pub id: u64,
    pub market_id: String,
    pub owner_id: u64,
    pub sub_account_id: u64,

    // Command
    pub side: Side,
    pub order_type: OrderType,
    pub stop: StopType,
    pub price: Decimal,
    pub stop_price: Decimal,
    pub amount: Decimal,
    pub funds: Decimal,

    // Accounting, mutated by the engine
    pub status: OrderStatus,
    pub locked_funds: Decimal,
    pub used_funds: Decimal,
    pub filled_amount: Decimal,
    pub filled_quote: Decimal,
    pub fee_amount: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,

    // Composite legs
    pub tp_price: Decimal,
    pub tp_amount: Decimal,
    pub tp_status: OrderStatus,
    pub tp_order_id: u64,
    pub sl_price: Decimal,
    pub sl_amount: Decimal,
    pub sl_status: OrderStatus,
    pub sl_order_id: u64,
    pub parent_order_id: u64,
    pub init_order_id: u64,
    pub oto_type: Option<OtoType>,
    /// Base-coin lock of the sell leg of a strangle / straddle.
    pub opposite_locked_funds: Decimal,

    // Trailing stop
    pub ts_activation_price: Decimal,
    pub ts_price: Decimal,
    pub ts_price_type: TsPriceType,
    /// Most favourable price observed since tracking began; zero while
    /// waiting for activation.
    pub ts_reference_price: Decimal,

    /// Admission time, nanoseconds since the Unix epoch.
    pub created_at: i64,
}

impl Order {
    /// A bare order with every optional field zeroed.
    pub fn new(
        id: u64,
        market_id: impl Into<String>,
        side: Side,
        order_type: OrderType,
        price: Decimal,
        amount: Decimal,
    ) -> Self {
        Order {
            id,
            market_id: market_id.into(),
            side,
            order_type,
            price,
            amount,
            ..Order::default()
        }
    }

    pub fn remaining_amount(&self) -> Decimal {
        self.amount - self.filled_amount
    }

    pub fn remaining_funds(&self) -> Decimal {
        self.locked_funds - self.used_funds
    }

    pub fn is_filled(&self) -> bool {
        self.filled_amount >= self.amount
    }

    /// Orders of these types match with a price limit and may rest.
    pub fn is_limit_like(&self) -> bool {
        matches!(self.order_type, OrderType::Limit | OrderType::Oco | OrderType::Oto)
    }

    /// Strangle and straddle parents are virtual: their legs carry the locks.
    pub fn holds_funds(&self) -> bool {
        !self.order_type.is_virtual()
    }

    /// OTO init legs keep their trade proceeds reserved for the follow-up
    /// leg instead of crediting them as available.
    pub fn holds_proceeds(&self) -> bool {
        self.order_type == OrderType::Oto
    }

    /// Coin reserved by this order: quote for buys, base for sells.
    pub fn lock_coin<'m>(&self, market: &'m Market) -> &'m str {
        match self.side {
            Side::Buy => &market.quote_coin,
            Side::Sell => &market.market_coin,
        }
    }

    /// Coin credited by this order's fills.
    pub fn proceeds_coin<'m>(&self, market: &'m Market) -> &'m str {
        match self.side {
            Side::Buy => &market.market_coin,
            Side::Sell => &market.quote_coin,
        }
    }

    /// Net proceeds so far: base for buys, quote for sells, after fees.
    pub fn net_proceeds(&self) -> Decimal {
        match self.side {
            Side::Buy => self.filled_amount - self.fee_amount,
            Side::Sell => self.filled_quote - self.fee_amount,
        }
    }

    /// Record one fill against this order.
    pub fn apply_fill(&mut self, volume: Decimal, quote_volume: Decimal, fee: Decimal) {
        self.filled_amount += volume;
        self.filled_quote += quote_volume;
        self.fee_amount += fee;
        self.used_funds += match self.side {
            Side::Buy => quote_volume,
            Side::Sell => volume,
        };
        self.status = if self.is_filled() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Structural checks on a new-order command.
    pub fn valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<(), OrderError> {
        if self.id == 0 {
            return Err(OrderError::ZeroId);
        }
        for (field, value) in [
            ("price", self.price),
            ("stop_price", self.stop_price),
            ("amount", self.amount),
            ("funds", self.funds),
            ("locked_funds", self.locked_funds),
            ("opposite_locked_funds", self.opposite_locked_funds),
            ("tp_price", self.tp_price),
            ("tp_amount", self.tp_amount),
            ("sl_price", self.sl_price),
            ("sl_amount", self.sl_amount),
            ("ts_activation_price", self.ts_activation_price),
            ("ts_price", self.ts_price),
            ("maker_fee_rate", self.maker_fee_rate),
            ("taker_fee_rate", self.taker_fee_rate),
        ] {
            if value < Decimal::ZERO {
                return Err(OrderError::Negative { field });
            }
            if value > MAX_MAGNITUDE {
                return Err(OrderError::TooLarge { field });
            }
        }
        if self.amount.is_zero() {
            return Err(OrderError::ZeroAmount);
        }
        if self.stop != StopType::None {
            if !matches!(self.order_type, OrderType::Limit | OrderType::Market) {
                return Err(OrderError::InvalidComposite {
                    kind: "stop",
                    reason: "only limit and market orders take a stop",
                });
            }
            if self.stop_price.is_zero() {
                return Err(OrderError::MissingStopPrice);
            }
        }

        match self.order_type {
            OrderType::Limit => self.require_price(),
            OrderType::Market => {
                if self.funds.is_zero() {
                    Err(OrderError::MissingFunds)
                } else {
                    Ok(())
                }
            }
            OrderType::Oco => {
                self.require_price()?;
                if self.stop_price.is_zero() {
                    return Err(OrderError::MissingStopPrice);
                }
                if self.sl_order_id == 0 {
                    return Err(composite("oco", "missing stop leg id"));
                }
                Ok(())
            }
            OrderType::Oto => {
                self.require_price()?;
                match self.oto_type {
                    None => Err(composite("oto", "missing follow-up type")),
                    Some(OtoType::TakeProfit) if self.tp_price.is_zero() || self.tp_order_id == 0 => {
                        Err(composite("oto", "take profit needs tp_price and tp_order_id"))
                    }
                    Some(OtoType::StopLoss) if self.sl_price.is_zero() || self.sl_order_id == 0 => {
                        Err(composite("oto", "stop loss needs sl_price and sl_order_id"))
                    }
                    Some(_) => Ok(()),
                }
            }
            OrderType::Strangle | OrderType::Straddle => {
                let kind = if self.order_type == OrderType::Strangle {
                    "strangle"
                } else {
                    "straddle"
                };
                if self.tp_order_id == 0 || self.sl_order_id == 0 || self.tp_order_id == self.sl_order_id {
                    return Err(composite(kind, "two distinct leg ids required"));
                }
                if self.tp_price.is_zero() || self.sl_price.is_zero() {
                    return Err(composite(kind, "both leg prices required"));
                }
                if self.order_type == OrderType::Strangle && self.sl_price >= self.tp_price {
                    return Err(composite(kind, "sl_price must be below tp_price"));
                }
                if self.order_type == OrderType::Straddle && self.sl_price != self.tp_price {
                    return Err(composite(kind, "legs must share one price"));
                }
                Ok(())
            }
            OrderType::TrailingStop => {
                if self.ts_price.is_zero() {
                    return Err(composite("trailing_stop", "ts_price required"));
                }
                if self.ts_price_type == TsPriceType::Percentage && self.ts_price >= Decimal::ONE_HUNDRED {
                    return Err(composite("trailing_stop", "percentage offset must be below 100"));
                }
                if self.side == Side::Buy && self.funds.is_zero() {
                    return Err(OrderError::MissingFunds);
                }
                Ok(())
            }
        }
    }

    /// Cancel commands only need an id; limit cancels also carry a price.
    pub fn validate_cancel(&self) -> Result<(), OrderError> {
        if self.id == 0 {
            return Err(OrderError::ZeroId);
        }
        if self.order_type == OrderType::Limit && self.price < Decimal::ZERO {
            return Err(OrderError::Negative { field: "price" });
        }
        Ok(())
    }

    /// Balance and market-limit checks, run under the account lock.
    ///
    /// `available` is the spendable balance of [`lock_coin`](Self::lock_coin).
    pub fn is_valid_against_balance(&self, available: Decimal, market: &Market) -> Result<(), OrderError> {
        if self.locked_funds > available {
            return Err(OrderError::InsufficientFunds {
                available,
                required: self.locked_funds,
            });
        }
        if self.is_limit_like() && !market.max_market_price.is_zero() && self.price > market.max_market_price {
            return Err(OrderError::PriceTooHigh {
                price: self.price,
                max: market.max_market_price,
            });
        }
        match self.side {
            Side::Buy => {
                if self.amount < market.min_market_volume {
                    return Err(OrderError::BelowMinVolume {
                        volume: self.amount,
                        min: market.min_market_volume,
                    });
                }
                if self.locked_funds < market.min_quote_volume {
                    return Err(OrderError::BelowMinQuoteVolume {
                        volume: self.locked_funds,
                        min: market.min_quote_volume,
                    });
                }
            }
            Side::Sell => {
                if self.locked_funds < market.min_market_volume {
                    return Err(OrderError::BelowMinVolume {
                        volume: self.locked_funds,
                        min: market.min_market_volume,
                    });
                }
            }
        }
        Ok(())
    }

    /// Current time in nanoseconds since the Unix epoch.
    pub fn current_timestamp_ns() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default()
    }

    fn require_price(&self) -> Result<(), OrderError> {
        if self.price.is_zero() {
            Err(OrderError::MissingPrice)
        } else {
            Ok(())
        }
    }
}

fn composite(kind: &'static str, reason: &'static str) -> OrderError {
    OrderError::InvalidComposite { kind, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit(side: Side, price: Decimal, amount: Decimal) -> Order {
        Order::new(1, "btcusdt", side, OrderType::Limit, price, amount)
    }

    #[test]
    fn limit_requires_price_and_amount() {
        assert!(limit(Side::Buy, dec!(100), dec!(1)).valid());
        assert_eq!(limit(Side::Buy, dec!(0), dec!(1)).validate(), Err(OrderError::MissingPrice));
        assert_eq!(limit(Side::Buy, dec!(100), dec!(0)).validate(), Err(OrderError::ZeroAmount));
        let mut zero_id = limit(Side::Buy, dec!(100), dec!(1));
        zero_id.id = 0;
        assert_eq!(zero_id.validate(), Err(OrderError::ZeroId));
    }

    #[test]
    fn negative_amount_is_invalid_amount() {
        let o = limit(Side::Sell, dec!(100), dec!(-1));
        let err = o.validate().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidAmount);
    }

    #[test]
    fn oversized_values_are_refused() {
        let o = limit(Side::Buy, Decimal::MAX, dec!(2));
        let err = o.validate().unwrap_err();
        assert_eq!(err, OrderError::TooLarge { field: "price" });
        assert_eq!(err.code(), crate::ErrorCode::InvalidAmount);

        assert!(limit(Side::Buy, MAX_MAGNITUDE, MAX_MAGNITUDE).valid());
        let mut funds = Order::new(7, "btcusdt", Side::Buy, OrderType::Market, dec!(0), dec!(1));
        funds.funds = MAX_MAGNITUDE + dec!(1);
        assert_eq!(funds.validate(), Err(OrderError::TooLarge { field: "funds" }));
    }

    #[test]
    fn stop_order_needs_stop_price() {
        let mut o = limit(Side::Sell, dec!(100), dec!(1));
        o.stop = StopType::Loss;
        assert_eq!(o.validate(), Err(OrderError::MissingStopPrice));
        o.stop_price = dec!(95);
        assert!(o.valid());
    }

    #[test]
    fn market_needs_funds() {
        let mut o = Order::new(7, "btcusdt", Side::Buy, OrderType::Market, dec!(0), dec!(1));
        assert_eq!(o.validate(), Err(OrderError::MissingFunds));
        o.funds = dec!(10);
        assert!(o.valid());
    }

    #[test]
    fn strangle_requires_ordered_prices() {
        let mut o = Order::new(3, "btcusdt", Side::Buy, OrderType::Strangle, dec!(0), dec!(1));
        o.tp_order_id = 4;
        o.sl_order_id = 5;
        o.tp_price = dec!(100);
        o.sl_price = dec!(110);
        assert!(!o.valid());
        o.sl_price = dec!(90);
        assert!(o.valid());
        o.order_type = OrderType::Straddle;
        assert!(!o.valid());
        o.sl_price = dec!(100);
        assert!(o.valid());
    }

    #[test]
    fn balance_check_uses_lock_and_minimums() {
        let mut market = Market::new("btcusdt", "btc", "usdt", 8, 8);
        market.min_market_volume = dec!(0.0001);
        let mut sell = limit(Side::Sell, dec!(20000), dec!(0.5));
        sell.locked_funds = dec!(0.5);
        assert!(sell.is_valid_against_balance(dec!(1), &market).is_ok());
        assert_eq!(
            sell.is_valid_against_balance(dec!(0.4), &market).unwrap_err().code(),
            crate::ErrorCode::InsufficientFunds
        );
        sell.locked_funds = dec!(0.00001);
        assert!(sell.is_valid_against_balance(dec!(1), &market).is_err());
    }

    #[test]
    fn fills_track_used_funds_per_side() {
        let mut buy = limit(Side::Buy, dec!(100), dec!(2));
        buy.locked_funds = dec!(200);
        buy.apply_fill(dec!(1), dec!(99), dec!(0.001));
        assert_eq!(buy.used_funds, dec!(99));
        assert_eq!(buy.status, OrderStatus::PartiallyFilled);
        buy.apply_fill(dec!(1), dec!(100), dec!(0.001));
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(buy.net_proceeds(), dec!(1.998));

        let mut sell = limit(Side::Sell, dec!(100), dec!(1));
        sell.apply_fill(dec!(1), dec!(100), dec!(0.1));
        assert_eq!(sell.used_funds, dec!(1));
        assert_eq!(sell.net_proceeds(), dec!(99.9));
    }
}
