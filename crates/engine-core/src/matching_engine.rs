//! Per-market matching engine.
//!
//! Owns one [`OrderBook`] and the market's [`Composites`] tracker and
//! turns each [`OrderCommand`] into an ordered batch of [`Event`]s:
//!
//! 1. Validate the command; an invalid one yields exactly one `error`
//!    event and mutates nothing.
//! 2. Run it against the book (or park it).
//! 3. Settle: walk the emitted events through the composite tracker, then
//!    fire parked stops whose trigger the last price now satisfies, and
//!    repeat until nothing moves.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::composite::{Composites, Reaction, Trigger};
use crate::error::{ErrorCode, OrderError};
use crate::market::Market;
use crate::messages::{CommandType, ErrorEvent, Event, EventBody, OrderCommand};
use crate::order::Order;
use crate::order_book::OrderBook;
use crate::order_type::{OrderType, StopType};
use crate::sequence::Sequencer;
use crate::status::OrderStatus;

/// Matching engine of a single market.
#[derive(Debug)]
pub struct MatchingEngine {
    book: OrderBook,
    composites: Composites,
}

impl MatchingEngine {
    pub fn new(market: Market) -> Self {
        MatchingEngine {
            book: OrderBook::new(market),
            composites: Composites::new(),
        }
    }

    pub fn market(&self) -> &Market {
        self.book.market()
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn event_seq(&self) -> u64 {
        self.book.sequencer().event_seq()
    }

    pub fn trade_seq(&self) -> u64 {
        self.book.sequencer().trade_seq()
    }

    pub fn last_price(&self) -> Decimal {
        self.book.last_price()
    }

    /// Seed the engine with persisted open orders and sequence counters.
    ///
    /// Replaces whatever the engine held before. Composite parents rebuild
    /// their parked legs from their own fields.
    pub fn load(&mut self, open_orders: impl IntoIterator<Item = Order>, event_seq: u64, trade_seq: u64) {
        self.book.clear();
        self.composites.clear();
        self.book.set_sequencer(Sequencer::new(event_seq, trade_seq));

        for order in open_orders {
            if order.status.is_terminal() || order.market_id != self.book.market().id {
                continue;
            }
            match order.order_type {
                OrderType::Limit | OrderType::Market => self.book.restore(order),
                OrderType::Oco => {
                    if order.filled_amount.is_zero() && order.sl_status == OrderStatus::Pending {
                        self.composites.track_oco(&order);
                    }
                    self.book.restore(order);
                }
                OrderType::Oto => {
                    self.composites.track_oto(order.id);
                    self.book.restore(order);
                }
                OrderType::Strangle | OrderType::Straddle => self.composites.track_pair(order),
                OrderType::TrailingStop => {
                    self.composites.track_trailing(order, Decimal::ZERO);
                }
            }
        }
    }

    /// Bring the engine up to date with events that were published but not
    /// yet reflected in the loaded state. Events at or below the current
    /// event sequence are skipped, so replaying twice is harmless.
    pub fn replay(&mut self, events: &[Event]) {
        let mut open = self.open_orders();
        let mut index: HashMap<u64, usize> = open.iter().enumerate().map(|(i, o)| (o.id, i)).collect();
        let mut seq = self.book.sequencer();
        let mut last_price = self.book.last_price();

        for event in events {
            if event.seq_id <= seq.event_seq() || event.market_id != self.book.market().id {
                continue;
            }
            seq.observe(event);
            if let Some(t) = event.trade() {
                last_price = t.trade.price;
            }
            for snapshot in event.order_snapshots() {
                match index.get(&snapshot.id) {
                    Some(&i) => open[i] = snapshot.clone(),
                    None => {
                        index.insert(snapshot.id, open.len());
                        open.push(snapshot.clone());
                    }
                }
            }
        }

        open.retain(|o| !o.status.is_terminal());
        self.load(open, seq.event_seq(), seq.trade_seq());
        self.book.set_last_price(last_price);
    }

    /// Every open order, book first, then composite parents.
    pub fn open_orders(&self) -> Vec<Order> {
        let mut orders = self.book.open_orders();
        orders.extend(self.composites.open_orders());
        orders
    }

    pub fn process(&mut self, cmd: OrderCommand) -> Vec<Event> {
        self.process_at(cmd, Order::current_timestamp_ns())
    }

    /// Process one command with an explicit event timestamp.
    pub fn process_at(&mut self, cmd: OrderCommand, now: i64) -> Vec<Event> {
        self.book.set_clock(now);
        let mut out = Vec::new();
        match cmd.event_type {
            CommandType::NewOrder => self.new_order(cmd.order, now, &mut out),
            CommandType::CancelOrder => self.cancel_order(cmd.order, &mut out),
        }
        self.settle(&mut out);
        out
    }

    // -------------------------------------------------------------------------
    // Internal handlers
    // -------------------------------------------------------------------------

    fn check_new(&self, order: &Order) -> Result<(), OrderError> {
        let market = self.book.market();
        if order.market_id != market.id {
            return Err(OrderError::WrongMarket {
                expected: market.id.clone(),
                found: order.market_id.clone(),
            });
        }
        order.validate()?;
        let ids = [order.id, order.tp_order_id, order.sl_order_id];
        if let Some(&dup) = ids
            .iter()
            .find(|&&id| id != 0 && (self.book.contains(id) || self.composites.contains(id)))
        {
            return Err(OrderError::DuplicateId(dup));
        }
        Ok(())
    }

    fn new_order(&mut self, mut order: Order, now: i64, out: &mut Vec<Event>) {
        if let Err(err) = self.check_new(&order) {
            self.reject(&order, err.code(), err.to_string(), out);
            return;
        }
        if order.created_at == 0 {
            order.created_at = now;
        }

        match order.order_type {
            OrderType::Limit | OrderType::Market => self.admit(order, out),
            OrderType::Oco => {
                order.sl_status = OrderStatus::Pending;
                self.composites.track_oco(&order);
                self.book.execute(order, out);
            }
            OrderType::Oto => {
                self.composites.track_oto(order.id);
                self.book.execute(order, out);
            }
            OrderType::Strangle | OrderType::Straddle => {
                order.status = OrderStatus::Untouched;
                order.tp_status = OrderStatus::Pending;
                order.sl_status = OrderStatus::Pending;
                self.book.emit_status(out, &order);
                self.composites.track_pair(order);
            }
            OrderType::TrailingStop => {
                order.status = OrderStatus::Untouched;
                let snapshot = self.composites.track_trailing(order, self.book.last_price());
                self.book.emit_status(out, &snapshot);
            }
        }
    }

    /// Run a plain limit / market order, or park it when it carries a stop.
    fn admit(&mut self, order: Order, out: &mut Vec<Event>) {
        if order.stop == StopType::None {
            self.book.execute(order, out);
        } else {
            self.book.park(order, out);
        }
    }

    fn cancel_order(&mut self, cmd: Order, out: &mut Vec<Event>) {
        let market_id = self.book.market().id.clone();
        let invalid = match cmd.validate_cancel() {
            Err(err) => Some((ErrorCode::InvalidOrder, err.to_string())),
            Ok(()) if cmd.market_id != market_id => {
                Some((ErrorCode::InvalidOrder, format!("order belongs to market {}", cmd.market_id)))
            }
            Ok(()) => None,
        };
        if let Some((code, message)) = invalid {
            self.reject(&cmd, code, message, out);
            return;
        }

        let owned = |o: &Order| cmd.owner_id == 0 || o.owner_id == cmd.owner_id;

        if let Some(found) = self.book.get(cmd.id) {
            if owned(found) {
                if let Some(mut order) = self.book.remove(cmd.id) {
                    order.status = OrderStatus::Cancelled;
                    self.book.emit_status(out, &order);
                    return;
                }
            }
        } else if let Some(found) = self.composites.find(cmd.id) {
            if owned(found) {
                if let Some(plan) = self.composites.cancel(cmd.id) {
                    for leg in &plan.cancelled {
                        self.book.emit_status(out, leg);
                    }
                    if let Some(parent_id) = plan.book_order {
                        if let Some(mut parent) = self.book.remove(parent_id) {
                            parent.status = OrderStatus::Cancelled;
                            parent.sl_status = OrderStatus::Cancelled;
                            self.book.emit_status(out, &parent);
                        }
                    }
                    return;
                }
            }
        }

        self.reject(&cmd, ErrorCode::CancelFailed, format!("order {} is not open", cmd.id), out);
    }

    fn reject(&mut self, order: &Order, code: ErrorCode, message: String, out: &mut Vec<Event>) {
        self.book.emit(
            out,
            EventBody::Error(ErrorEvent {
                code,
                order_id: order.id,
                owner_id: order.owner_id,
                message,
            }),
        );
    }

    fn settle(&mut self, out: &mut Vec<Event>) {
        let mut cursor = 0;
        loop {
            while cursor < out.len() {
                let reactions = self.composites.react(&out[cursor], self.book.market());
                cursor += 1;
                for reaction in reactions {
                    self.apply(reaction, out);
                }
            }

            if let Some(order) = self.book.take_triggered_stop() {
                self.activate(order, out);
                continue;
            }
            match self.composites.take_triggered(self.book.last_price()) {
                Some(trigger) => self.fire(trigger, out),
                None => break,
            }
        }
    }

    fn apply(&mut self, reaction: Reaction, out: &mut Vec<Event>) {
        match reaction {
            Reaction::Cancelled(leg) => {
                if let Some(parent) = self.book.resting_mut(leg.parent_order_id) {
                    if parent.sl_order_id == leg.id {
                        parent.sl_status = OrderStatus::Cancelled;
                    } else if parent.tp_order_id == leg.id {
                        parent.tp_status = OrderStatus::Cancelled;
                    }
                }
                self.book.emit_status(out, &leg);
            }
            Reaction::Updated(order) => self.book.emit_status(out, &order),
            Reaction::Admit(leg) => self.admit(leg, out),
        }
    }

    /// A parked stop fired: it becomes its underlying limit / market order.
    fn activate(&mut self, mut order: Order, out: &mut Vec<Event>) -> Order {
        order.stop = StopType::None;
        self.book.emit(out, EventBody::OrderActivation { order: order.clone() });
        self.book.execute(order, out)
    }

    fn fire(&mut self, trigger: Trigger, out: &mut Vec<Event>) {
        match trigger {
            Trigger::OcoStop { parent_id, mut leg } => {
                let Some(mut parent) = self.book.remove(parent_id) else {
                    return;
                };
                leg.locked_funds = parent.remaining_funds();
                if leg.order_type == OrderType::Market {
                    leg.funds = leg.locked_funds;
                }
                parent.locked_funds = parent.used_funds;
                parent.status = OrderStatus::Cancelled;
                parent.sl_status = OrderStatus::Untouched;
                self.book.emit_status(out, &parent);
                self.activate(leg, out);
            }
            Trigger::PairLeg {
                mut parent,
                leg,
                mut sibling,
            } => {
                let bought = leg.id == parent.tp_order_id;
                sibling.status = OrderStatus::Cancelled;
                self.book.emit_status(out, &sibling);

                let done = self.activate(leg, out);
                parent.status = done.status;
                parent.filled_amount = done.filled_amount;
                parent.filled_quote = done.filled_quote;
                parent.fee_amount = done.fee_amount;
                if bought {
                    parent.tp_status = done.status;
                    parent.sl_status = OrderStatus::Cancelled;
                } else {
                    parent.sl_status = done.status;
                    parent.tp_status = OrderStatus::Cancelled;
                }
                self.book.emit_status(out, &parent);
            }
            Trigger::Trailing { order } => {
                self.activate(order, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side::Side;
    use rust_decimal_macros::dec;

    fn engine() -> MatchingEngine {
        MatchingEngine::new(Market::new("btcusdt", "btc", "usdt", 8, 8))
    }

    fn limit(id: u64, owner: u64, side: Side, price: Decimal, amount: Decimal) -> OrderCommand {
        let mut o = Order::new(id, "btcusdt", side, OrderType::Limit, price, amount);
        o.owner_id = owner;
        o.locked_funds = match side {
            Side::Buy => price * amount,
            Side::Sell => amount,
        };
        OrderCommand::new_order(o)
    }

    #[test]
    fn invalid_order_emits_exactly_one_error() {
        let mut e = engine();
        let events = e.process_at(limit(0, 1, Side::Buy, dec!(10), dec!(1)), 1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error().map(|err| err.code), Some(ErrorCode::InvalidOrder));
        assert!(e.open_orders().is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut e = engine();
        e.process_at(limit(1, 1, Side::Buy, dec!(10), dec!(1)), 1);
        let events = e.process_at(limit(1, 1, Side::Buy, dec!(11), dec!(1)), 2);
        assert_eq!(events.len(), 1);
        assert!(events[0].error().is_some());
        assert_eq!(e.book().best_bid_price(), Some(dec!(10)));
    }

    #[test]
    fn cancel_of_unknown_order_fails() {
        let mut e = engine();
        let events = e.process_at(OrderCommand::cancel("btcusdt", 42, 1), 1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error().map(|err| err.code), Some(ErrorCode::CancelFailed));
    }

    #[test]
    fn cancel_checks_owner() {
        let mut e = engine();
        e.process_at(limit(1, 7, Side::Sell, dec!(10), dec!(1)), 1);
        let denied = e.process_at(OrderCommand::cancel("btcusdt", 1, 8), 2);
        assert_eq!(denied[0].error().map(|err| err.code), Some(ErrorCode::CancelFailed));
        let ok = e.process_at(OrderCommand::cancel("btcusdt", 1, 7), 3);
        assert_eq!(ok[0].order().map(|o| o.status), Some(OrderStatus::Cancelled));
    }

    #[test]
    fn event_sequence_is_strictly_increasing() {
        let mut e = engine();
        let mut all = Vec::new();
        all.extend(e.process_at(limit(1, 1, Side::Sell, dec!(10), dec!(1)), 1));
        all.extend(e.process_at(limit(2, 2, Side::Buy, dec!(10), dec!(0.5)), 2));
        all.extend(e.process_at(OrderCommand::cancel("btcusdt", 1, 1), 3));
        all.extend(e.process_at(OrderCommand::cancel("btcusdt", 1, 1), 4));
        let seqs: Vec<u64> = all.iter().map(|ev| ev.seq_id).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
        assert_eq!(e.trade_seq(), 1);
    }
}
