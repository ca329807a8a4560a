//! Static market configuration and the rounding rules derived from it.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Trading status of a market.
///
/// - `Active` accepts new orders and cancels.
/// - `Inactive` accepts cancels only.
/// - `Disabled` rejects both.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    #[default]
    Active,
    Inactive,
    Disabled,
}

/// One spot market, e.g. `btcusdt`.
///
/// `market_precision` is the number of fractional digits of base-coin
/// amounts, `quote_precision` the same for quote-coin amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub market_coin: String,
    pub quote_coin: String,
    pub market_precision: u32,
    pub quote_precision: u32,
    #[serde(default)]
    pub min_market_volume: Decimal,
    #[serde(default)]
    pub min_quote_volume: Decimal,
    /// Upper bound for limit prices; zero disables the check.
    #[serde(default)]
    pub max_market_price: Decimal,
    #[serde(default)]
    pub status: MarketStatus,
}

impl Market {
    pub fn new(
        id: impl Into<String>,
        market_coin: impl Into<String>,
        quote_coin: impl Into<String>,
        market_precision: u32,
        quote_precision: u32,
    ) -> Self {
        Market {
            id: id.into(),
            market_coin: market_coin.into(),
            quote_coin: quote_coin.into(),
            market_precision,
            quote_precision,
            min_market_volume: Decimal::ZERO,
            min_quote_volume: Decimal::ZERO,
            max_market_price: Decimal::ZERO,
            status: MarketStatus::Active,
        }
    }

    pub fn accepts_orders(&self) -> bool {
        self.status == MarketStatus::Active
    }

    pub fn accepts_cancels(&self) -> bool {
        self.status != MarketStatus::Disabled
    }

    /// `price × volume`, truncated to the quote precision.
    pub fn quote_volume(&self, price: Decimal, volume: Decimal) -> Decimal {
        self.truncate_quote(price * volume)
    }

    pub fn truncate_volume(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.market_precision, RoundingStrategy::ToZero)
    }

    pub fn truncate_quote(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.quote_precision, RoundingStrategy::ToZero)
    }

    /// Largest volume (at market precision) whose cost at `price` fits in
    /// `funds`. A quotient past `Decimal`'s range reads as `Decimal::MAX`.
    pub fn affordable_volume(&self, funds: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO || funds <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.truncate_volume(funds.checked_div(price).unwrap_or(Decimal::MAX))
    }

    /// Quote funds a buy of `amount` at `price` must lock. Rounded away from
    /// zero so the lock always covers the truncated quote volumes. `None`
    /// when the cost overflows.
    pub fn buy_lock(&self, amount: Decimal, price: Decimal) -> Option<Decimal> {
        amount
            .checked_mul(price)
            .map(|cost| cost.round_dp_with_strategy(self.quote_precision, RoundingStrategy::AwayFromZero))
    }
}
