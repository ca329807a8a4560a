//! Pre-submission risk policies of the order queue.
//!
//! Every check here runs before the account lock is taken; only the final
//! balance check runs under it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use engine_core::{Decimal, Market, Order};
use engine_funds::FundsEngine;
use tracing::{debug, warn};

use crate::config::{BonusEntry, ExchangeConfig, RiskConfig};
use crate::error::QueueError;

/// External prices: coin conversion rates and per-market reference prices.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// How many `to` one `from` is worth.
    async fn rate(&self, from: &str, to: &str) -> Option<Decimal>;

    async fn reference_price(&self, market_id: &str) -> Option<Decimal>;
}

/// Bonus exposure of one sub-account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BonusExposure {
    /// Sum of active bonus contracts.
    pub active: Decimal,
    /// Bonus amount not yet earned out.
    pub outstanding: Decimal,
}

#[async_trait]
pub trait RiskDataSource: Send + Sync {
    /// `None` for accounts without a bonus.
    async fn bonus(&self, user_id: u64, sub_account_id: u64) -> Option<BonusExposure>;
}

/// Rates and reference prices loaded from the exchange file.
#[derive(Debug, Default)]
pub struct StaticRates {
    rates: HashMap<(String, String), Decimal>,
    reference: parking_lot::RwLock<HashMap<String, Decimal>>,
}

impl StaticRates {
    pub fn from_config(config: &ExchangeConfig) -> Self {
        StaticRates {
            rates: config
                .rates
                .iter()
                .map(|r| ((r.from.clone(), r.to.clone()), r.rate))
                .collect(),
            reference: parking_lot::RwLock::new(
                config
                    .reference_prices
                    .iter()
                    .map(|p| (p.market.clone(), p.price))
                    .collect(),
            ),
        }
    }

    pub fn set_reference_price(&self, market_id: &str, price: Decimal) {
        self.reference.write().insert(market_id.to_string(), price);
    }
}

#[async_trait]
impl RateSource for StaticRates {
    async fn rate(&self, from: &str, to: &str) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::ONE);
        }
        if let Some(rate) = self.rates.get(&(from.to_string(), to.to_string())) {
            return Some(*rate);
        }
        self.rates
            .get(&(to.to_string(), from.to_string()))
            .filter(|r| !r.is_zero())
            .map(|r| Decimal::ONE / *r)
    }

    async fn reference_price(&self, market_id: &str) -> Option<Decimal> {
        self.reference.read().get(market_id).copied()
    }
}

#[derive(Debug, Default)]
pub struct StaticRiskData {
    bonus: HashMap<(u64, u64), BonusExposure>,
}

impl StaticRiskData {
    pub fn new(entries: &[BonusEntry]) -> Self {
        StaticRiskData {
            bonus: entries
                .iter()
                .map(|b| {
                    (
                        (b.user_id, b.sub_account_id),
                        BonusExposure {
                            active: b.active,
                            outstanding: b.outstanding,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl RiskDataSource for StaticRiskData {
    async fn bonus(&self, user_id: u64, sub_account_id: u64) -> Option<BonusExposure> {
        self.bonus.get(&(user_id, sub_account_id)).copied()
    }
}

pub struct RiskPolicy {
    config: RiskConfig,
    rates: Arc<dyn RateSource>,
    data: Arc<dyn RiskDataSource>,
}

impl RiskPolicy {
    pub fn new(config: RiskConfig, rates: Arc<dyn RateSource>, data: Arc<dyn RiskDataSource>) -> Self {
        RiskPolicy { config, rates, data }
    }

    /// Everything off.
    pub fn permissive(rates: Arc<dyn RateSource>) -> Self {
        Self::new(RiskConfig::default(), rates, Arc::new(StaticRiskData::default()))
    }

    pub fn rates(&self) -> &Arc<dyn RateSource> {
        &self.rates
    }

    pub async fn check(&self, order: &Order, market: &Market, funds: &FundsEngine) -> Result<(), QueueError> {
        let needs_bonus = self.config.bonus_allowlist_enabled || self.config.high_risk_enabled;
        let bonus = if needs_bonus {
            self.data.bonus(order.owner_id, order.sub_account_id).await
        } else {
            None
        };

        if let Some(bonus) = bonus {
            if self.config.bonus_allowlist_enabled && !self.config.bonus_markets.iter().any(|m| *m == market.id) {
                return Err(QueueError::MarketNotAllowed {
                    market: market.id.clone(),
                });
            }
            if self.config.high_risk_enabled {
                self.check_high_risk(order, market, funds, bonus).await?;
            }
        }

        if self.config.abnormal_price_enabled && order.is_limit_like() {
            self.check_price(order, market).await?;
        }
        Ok(())
    }

    /// `(Σ balance × rate − outstanding) / active` in the market's quote coin,
    /// rejected above the threshold.
    async fn check_high_risk(
        &self,
        order: &Order,
        market: &Market,
        funds: &FundsEngine,
        bonus: BonusExposure,
    ) -> Result<(), QueueError> {
        if bonus.active <= Decimal::ZERO {
            return Ok(());
        }
        let balances = funds.get_balances(order.owner_id, order.sub_account_id)?;
        let mut equity = Decimal::ZERO;
        for (coin, balance) in &balances {
            let total = balance.total();
            if total.is_zero() {
                continue;
            }
            match self.rates.rate(coin, &market.quote_coin).await {
                Some(rate) => {
                    equity = total
                        .checked_mul(rate)
                        .and_then(|value| equity.checked_add(value))
                        .ok_or(QueueError::Overflow("equity"))?;
                }
                None => warn!(coin = %coin, quote = %market.quote_coin, "no rate, coin left out of equity"),
            }
        }
        let ratio = equity
            .checked_sub(bonus.outstanding)
            .and_then(|free| free.checked_div(bonus.active))
            .ok_or(QueueError::Overflow("free equity ratio"))?;
        debug!(user = order.owner_id, %ratio, "bonus free-equity ratio");
        if ratio > self.config.high_risk_threshold {
            return Err(QueueError::HighRisk {
                ratio,
                threshold: self.config.high_risk_threshold,
            });
        }
        Ok(())
    }

    async fn check_price(&self, order: &Order, market: &Market) -> Result<(), QueueError> {
        let Some(reference) = self.rates.reference_price(&market.id).await else {
            return Ok(());
        };
        if reference <= Decimal::ZERO {
            return Ok(());
        }
        // a ratio past Decimal's range is as abnormal as it gets
        let pct = order
            .price
            .checked_div(reference)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .unwrap_or(Decimal::MAX);
        if pct < self.config.min_price_pct || pct > self.config.max_price_pct {
            return Err(QueueError::AbnormalPrice {
                price: order.price,
                reference,
                pct,
            });
        }
        Ok(())
    }
}
