//! Applies a market's published events to the balance ledger.

use std::sync::Arc;

use engine_core::{Event, EventBody, Market, Order, OrderStatus, Trade};
use engine_funds::{AccountKey, FundsEngine, FundsError};
use rust_decimal::Decimal;
use tracing::error;

/// Balance side of one market's event stream.
pub struct EventFanout {
    market: Market,
    funds: Arc<FundsEngine>,
    revenue: AccountKey,
}

impl EventFanout {
    pub fn new(market: Market, funds: Arc<FundsEngine>, revenue: AccountKey) -> Self {
        EventFanout { market, funds, revenue }
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    /// Settle `events` in order. Stops at the first failure; every failure
    /// here means the ledger and the engine disagree.
    pub fn settle(&self, events: &[Event]) -> Result<(), FundsError> {
        for event in events {
            if event.market_id != self.market.id {
                continue;
            }
            let outcome = match &event.body {
                EventBody::NewTrade(nt) => self.trade(&nt.trade, &nt.ask_order, &nt.bid_order),
                EventBody::OrderStatusChange { order } if order.status == OrderStatus::Cancelled => {
                    self.release(order)
                }
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                self.report(event, &err);
                return Err(err);
            }
        }
        Ok(())
    }

    fn trade(&self, trade: &Trade, ask_order: &Order, bid_order: &Order) -> Result<(), FundsError> {
        self.funds
            .trade(trade, ask_order, bid_order, &self.market, trade.ask_credit(), trade.bid_credit())?;
        let AccountKey {
            user_id,
            sub_account_id,
        } = self.revenue;
        self.funds
            .credit_revenue(user_id, sub_account_id, &self.market.market_coin, trade.bid_fee_amount)?;
        self.funds
            .credit_revenue(user_id, sub_account_id, &self.market.quote_coin, trade.ask_fee_amount)
    }

    /// A cancelled order gives back what it locked and did not use.
    fn release(&self, order: &Order) -> Result<(), FundsError> {
        if !order.holds_funds() {
            return Ok(());
        }
        let unused = order.locked_funds - order.used_funds;
        if unused <= Decimal::ZERO {
            return Ok(());
        }
        self.funds
            .cancel_order(order.owner_id, order.sub_account_id, order.lock_coin(&self.market), unused)
    }

    fn report(&self, event: &Event, err: &FundsError) {
        let accounts: Vec<AccountKey> = match &event.body {
            EventBody::NewTrade(nt) => vec![
                AccountKey::new(nt.trade.ask_owner_id, nt.trade.ask_sub_account_id),
                AccountKey::new(nt.trade.bid_owner_id, nt.trade.bid_sub_account_id),
                self.revenue,
            ],
            _ => event
                .order()
                .map(|o| vec![AccountKey::new(o.owner_id, o.sub_account_id)])
                .unwrap_or_default(),
        };
        for key in accounts {
            let state = self.funds.get_balances(key.user_id, key.sub_account_id);
            error!(
                market = %self.market.id,
                seq = event.seq_id,
                user = key.user_id,
                sub_account = key.sub_account_id,
                ?state,
                "account state at settlement failure"
            );
        }
        error!(market = %self.market.id, seq = event.seq_id, event = ?event, error = %err, "settlement failed");
    }
}
