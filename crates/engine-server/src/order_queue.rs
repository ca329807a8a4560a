//! Admission in front of the market engines.
//!
//! A new order is validated, stamped with the fee rates, run through the
//! risk policies, and then has its funds locked; the final balance check
//! runs inside the lock. Only then is it stored and handed to its market.
//! A failure after the lock gives the funds back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use engine_core::{CancelOutcome, Decimal, Market, Order, OrderCommand, OrderError, OrderStatus, OrderType, Side, StopType};
use engine_funds::{Balance, FundsEngine, FundsError, FundsOperation};
use tracing::{debug, info, warn};

use crate::config::FeeConfig;
use crate::error::{CancelError, QueueError};
use crate::market_engine::MarketHandle;
use crate::order_store::OrderStore;
use crate::risk::RiskPolicy;

/// Headroom a market buy locks over its reference cost.
const MARKET_BUY_SLIPPAGE: Decimal = Decimal::from_parts(11, 0, 0, false, 1);

pub struct OrderQueue {
    funds: Arc<FundsEngine>,
    markets: HashMap<String, MarketHandle>,
    store: Arc<dyn OrderStore>,
    risk: RiskPolicy,
    fees: FeeConfig,
    cancel_timeout: Duration,
}

/// What an admitted order reserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockPlan {
    /// A fixed amount of the order's lock coin.
    Fixed(Decimal),
    /// Quote sized against the available balance: at most `cap`, and at
    /// most `funds`.
    MarketBuy { cap: Option<Decimal>, funds: Decimal },
    /// Quote for the buy leg and base for the sell leg.
    Pair { quote: Decimal, base: Decimal },
}

impl OrderQueue {
    pub fn new(
        funds: Arc<FundsEngine>,
        markets: impl IntoIterator<Item = MarketHandle>,
        store: Arc<dyn OrderStore>,
        risk: RiskPolicy,
        fees: FeeConfig,
        cancel_timeout: Duration,
    ) -> Self {
        OrderQueue {
            funds,
            markets: markets.into_iter().map(|h| (h.market().id.clone(), h)).collect(),
            store,
            risk,
            fees,
            cancel_timeout,
        }
    }

    pub fn funds(&self) -> &Arc<FundsEngine> {
        &self.funds
    }

    pub fn market(&self, market_id: &str) -> Option<&MarketHandle> {
        self.markets.get(market_id)
    }

    pub fn markets(&self) -> impl Iterator<Item = &MarketHandle> {
        self.markets.values()
    }

    fn route(&self, market_id: &str) -> Result<&MarketHandle, QueueError> {
        self.markets
            .get(market_id)
            .ok_or_else(|| QueueError::UnknownMarket(market_id.to_string()))
    }

    /// Admit a new order. Returns its id once it is on the market's queue.
    pub async fn submit(&self, order: Order) -> Result<u64, QueueError> {
        let handle = self.route(&order.market_id)?;
        let market = handle.market();
        if !market.accepts_orders() {
            return Err(QueueError::MarketInactive(market.id.clone()));
        }

        let mut order = self.prepare(order);
        order.validate()?;
        self.risk.check(&order, market, &self.funds).await?;

        let plan = self.plan(&order, handle).await?;
        self.lock(&mut order, market, plan)?;

        match self.store.append(&order).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(market = %market.id, order = order.id, "order id still open, refusing");
                release_reserved(&self.funds, &order, market);
                return Err(OrderError::DuplicateId(order.id).into());
            }
            Err(err) => {
                warn!(order = order.id, error = %err, "order store append failed, releasing lock");
                release_reserved(&self.funds, &order, market);
                return Err(err.into());
            }
        }
        let id = order.id;
        if let Err(err) = handle.process(OrderCommand::new_order(order.clone())).await {
            release_reserved(&self.funds, &order, market);
            if let Err(store_err) = self.store.remove(&market.id, id).await {
                warn!(order = id, error = %store_err, "could not drop unsent order from the store");
            }
            return Err(err);
        }
        debug!(market = %market.id, order = id, locked = %order.locked_funds, "order admitted");
        Ok(id)
    }

    /// Cancel an order and wait for the engine's verdict.
    ///
    /// `owner_id` zero cancels on behalf of the exchange.
    pub async fn cancel(&self, market_id: &str, order_id: u64, owner_id: u64) -> Result<CancelOutcome, QueueError> {
        let handle = self.route(market_id)?;
        if !handle.market().accepts_cancels() {
            return Err(QueueError::MarketInactive(market_id.to_string()));
        }
        let cmd = OrderCommand::cancel(market_id, order_id, owner_id);
        cmd.order.validate_cancel()?;

        let registry = handle.registry();
        let waiter = registry.get_waiter(order_id)?;
        if let Err(err) = handle.process(cmd).await {
            registry.remove_waiter(order_id);
            return Err(err);
        }
        match tokio::time::timeout(self.cancel_timeout, waiter).await {
            Ok(Ok(outcome)) => {
                debug!(market = %market_id, order = order_id, outcome = outcome.as_str(), "cancel answered");
                Ok(outcome)
            }
            Ok(Err(_)) => Err(CancelError::Closed(market_id.to_string()).into()),
            Err(_) => {
                registry.remove_waiter(order_id);
                warn!(market = %market_id, order = order_id, "cancel timed out");
                Err(QueueError::CancelTimeout(order_id))
            }
        }
    }

    /// Run one deposit or withdrawal mutation.
    pub fn apply_funds(&self, op: &FundsOperation) -> Result<(), FundsError> {
        op.apply(&self.funds)?;
        let account = op.account();
        info!(op = op.name(), user = account.user_id, sub_account = account.sub_account_id, "funds operation applied");
        Ok(())
    }

    pub fn balances(&self, user_id: u64, sub_account_id: u64) -> Result<Vec<(String, Balance)>, FundsError> {
        Ok(self.funds.get_balances(user_id, sub_account_id)?.into_iter().collect())
    }

    /// Clear what the engine owns and stamp the fee rates.
    fn prepare(&self, mut order: Order) -> Order {
        order.status = OrderStatus::Pending;
        order.locked_funds = Decimal::ZERO;
        order.opposite_locked_funds = Decimal::ZERO;
        order.used_funds = Decimal::ZERO;
        order.filled_amount = Decimal::ZERO;
        order.filled_quote = Decimal::ZERO;
        order.fee_amount = Decimal::ZERO;
        order.ts_reference_price = Decimal::ZERO;
        order.parent_order_id = 0;
        order.init_order_id = 0;
        order.created_at = 0;
        order.maker_fee_rate = self.fees.maker_rate;
        order.taker_fee_rate = self.fees.taker_rate;
        if order.order_type == OrderType::Market && order.side == Side::Sell && order.funds.is_zero() {
            order.funds = order.amount;
        }
        order
    }

    async fn plan(&self, order: &Order, handle: &MarketHandle) -> Result<LockPlan, QueueError> {
        let market = handle.market();
        let cost = |amount: Decimal, price: Decimal| {
            market
                .buy_lock(amount, price)
                .ok_or(QueueError::Overflow("order cost"))
        };
        let plan = match (order.order_type, order.side) {
            (OrderType::Strangle | OrderType::Straddle, _) => {
                let quote = if order.funds > Decimal::ZERO {
                    order.funds
                } else {
                    cost(nonzero_or(order.tp_amount, order.amount), order.tp_price)?
                };
                LockPlan::Pair {
                    quote,
                    base: nonzero_or(order.sl_amount, order.amount),
                }
            }
            (OrderType::Market, Side::Buy) => {
                let reference = if order.stop != StopType::None {
                    Some(order.stop_price)
                } else {
                    match handle.last_price() {
                        Some(price) => Some(price),
                        None => self.risk.rates().reference_price(&market.id).await,
                    }
                };
                let cap = match reference.filter(|p| *p > Decimal::ZERO) {
                    Some(price) => {
                        let padded = price
                            .checked_mul(MARKET_BUY_SLIPPAGE)
                            .ok_or(QueueError::Overflow("reference price"))?;
                        Some(cost(order.amount, padded)?.max(cost(order.amount, price)?))
                    }
                    None => None,
                };
                LockPlan::MarketBuy { cap, funds: order.funds }
            }
            (OrderType::TrailingStop, Side::Buy) => LockPlan::Fixed(order.funds),
            (OrderType::Oco, Side::Buy) => {
                let stop_limit = nonzero_or(order.sl_price, order.stop_price);
                LockPlan::Fixed(cost(order.amount, order.price.max(stop_limit))?)
            }
            (_, Side::Buy) => LockPlan::Fixed(cost(order.amount, order.price)?),
            (_, Side::Sell) => LockPlan::Fixed(order.amount),
        };
        Ok(plan)
    }

    fn lock(&self, order: &mut Order, market: &Market, plan: LockPlan) -> Result<(), QueueError> {
        let (user, sub) = (order.owner_id, order.sub_account_id);
        match plan {
            LockPlan::Fixed(amount) => {
                order.locked_funds = amount;
                let probe = &*order;
                self.funds
                    .lock_new_order(user, sub, order.lock_coin(market), amount, |available| {
                        probe.is_valid_against_balance(available, market)
                    })?;
            }
            LockPlan::MarketBuy { cap, funds } => {
                let probe = order.clone();
                let locked = self.funds.lock_new_order_sized(user, sub, &market.quote_coin, |available| {
                    let mut lock = available.min(funds);
                    if let Some(cap) = cap {
                        lock = lock.min(cap);
                    }
                    if lock <= Decimal::ZERO {
                        return Err(OrderError::InsufficientFunds {
                            available,
                            required: funds,
                        });
                    }
                    let mut sized = probe;
                    sized.locked_funds = lock;
                    sized.is_valid_against_balance(available, market)?;
                    Ok(lock)
                })?;
                order.locked_funds = locked;
            }
            LockPlan::Pair { quote, base } => {
                order.locked_funds = quote;
                order.opposite_locked_funds = base;
                let probe = &*order;
                self.funds.lock_new_order_with(
                    user,
                    sub,
                    &[(market.quote_coin.as_str(), quote), (market.market_coin.as_str(), base)],
                    |available| check_pair(probe, market, available),
                )?;
            }
        }
        Ok(())
    }
}

/// Undo the admission lock of an order that never made it onto the book.
pub(crate) fn release_reserved(funds: &FundsEngine, order: &Order, market: &Market) {
    let parts = if order.order_type.is_virtual() {
        vec![
            (market.quote_coin.as_str(), order.locked_funds),
            (market.market_coin.as_str(), order.opposite_locked_funds),
        ]
    } else {
        vec![(order.lock_coin(market), order.locked_funds)]
    };
    for (coin, amount) in parts {
        if amount.is_zero() {
            continue;
        }
        if let Err(err) = funds.cancel_order(order.owner_id, order.sub_account_id, coin, amount) {
            warn!(order = order.id, coin = %coin, %amount, error = %err, "could not release order lock");
        }
    }
}

fn nonzero_or(value: Decimal, fallback: Decimal) -> Decimal {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}

/// Balance check of a strangle or straddle parent; `available` is
/// `[quote, base]`.
fn check_pair(order: &Order, market: &Market, available: &[Decimal]) -> Result<(), OrderError> {
    let quote = available.first().copied().unwrap_or_default();
    let base = available.get(1).copied().unwrap_or_default();
    if order.locked_funds > quote {
        return Err(OrderError::InsufficientFunds {
            available: quote,
            required: order.locked_funds,
        });
    }
    if order.opposite_locked_funds > base {
        return Err(OrderError::InsufficientFunds {
            available: base,
            required: order.opposite_locked_funds,
        });
    }
    if order.opposite_locked_funds < market.min_market_volume {
        return Err(OrderError::BelowMinVolume {
            volume: order.opposite_locked_funds,
            min: market.min_market_volume,
        });
    }
    if order.locked_funds < market.min_quote_volume {
        return Err(OrderError::BelowMinQuoteVolume {
            volume: order.locked_funds,
            min: market.min_quote_volume,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn slippage_is_ten_percent() {
        assert_eq!(MARKET_BUY_SLIPPAGE, dec!(1.1));
    }

    #[test]
    fn pair_check_needs_both_coins() {
        let market = Market::new("btcusdt", "btc", "usdt", 8, 8);
        let mut o = Order::new(1, "btcusdt", Side::Buy, OrderType::Strangle, dec!(0), dec!(1));
        o.locked_funds = dec!(100);
        o.opposite_locked_funds = dec!(1);
        assert!(check_pair(&o, &market, &[dec!(100), dec!(1)]).is_ok());
        assert!(matches!(
            check_pair(&o, &market, &[dec!(100), dec!(0.5)]),
            Err(OrderError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            check_pair(&o, &market, &[dec!(99), dec!(1)]),
            Err(OrderError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn nonzero_or_prefers_the_value() {
        assert_eq!(nonzero_or(dec!(2), dec!(5)), dec!(2));
        assert_eq!(nonzero_or(dec!(0), dec!(5)), dec!(5));
    }
}
