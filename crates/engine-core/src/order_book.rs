//! Single-market order book with price-time priority.
//!
//! - Bids: descending by price (best = highest).
//! - Asks: ascending by price (best = lowest).
//! - FIFO (time priority) within each price level.
//! - Trades execute at the resting (maker) order's price.
//!
//! The book also owns the market's stop-trigger set and its
//! [`Sequencer`], so every event it emits is numbered in order.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rust_decimal::Decimal;

use crate::market::Market;
use crate::messages::{Event, EventBody, NewTrade, Trade};
use crate::order::Order;
use crate::order_type::StopType;
use crate::sequence::Sequencer;
use crate::side::Side;
use crate::status::OrderStatus;
use crate::stops::StopSet;

/// Single-market order book.
#[derive(Debug)]
pub struct OrderBook {
    market: Market,

    /// Bids: price -> FIFO queue of orders at that price.
    ///
    /// `BTreeMap` keys are sorted ascending; the highest key is the best bid.
    bids: BTreeMap<Decimal, VecDeque<Order>>,

    /// Asks: price -> FIFO queue of orders at that price.
    ///
    /// The lowest key is the best ask.
    asks: BTreeMap<Decimal, VecDeque<Order>>,

    /// Where each resting order lives, for O(log n) cancels.
    resting: HashMap<u64, (Side, Decimal)>,

    stops: StopSet,
    seq: Sequencer,
    last_price: Decimal,

    /// Timestamp stamped on emitted events and trades.
    now: i64,
}

impl OrderBook {
    /// Create an empty order book for `market`.
    pub fn new(market: Market) -> Self {
        OrderBook {
            market,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            resting: HashMap::new(),
            stops: StopSet::new(),
            seq: Sequencer::default(),
            last_price: Decimal::ZERO,
            now: 0,
        }
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn sequencer(&self) -> Sequencer {
        self.seq
    }

    pub fn set_sequencer(&mut self, seq: Sequencer) {
        self.seq = seq;
    }

    pub fn observe(&mut self, event: &Event) {
        self.seq.observe(event);
        if let EventBody::NewTrade(t) = &event.body {
            self.last_price = t.trade.price;
        }
    }

    /// Price of the most recent trade (zero before the first one).
    pub fn last_price(&self) -> Decimal {
        self.last_price
    }

    pub fn set_last_price(&mut self, price: Decimal) {
        self.last_price = price;
    }

    pub fn set_clock(&mut self, now: i64) {
        self.now = now;
    }

    /// Append an event stamped with the next sequence number.
    pub fn emit(&mut self, out: &mut Vec<Event>, body: EventBody) {
        out.push(self.seq.event(&self.market.id, self.now, body));
    }

    pub fn emit_status(&mut self, out: &mut Vec<Event>, order: &Order) {
        self.emit(out, EventBody::OrderStatusChange { order: order.clone() });
    }

    /// Match `order` against the opposite side and then rest its residual
    /// (limit-like orders) or cancel it (market orders never rest).
    ///
    /// Emits, per maker touched: the trade, then the maker's status. The
    /// taker's final status is emitted last. Returns the taker's final state.
    pub fn execute(&mut self, mut order: Order, out: &mut Vec<Event>) -> Order {
        self.match_order(&mut order, out);

        if order.is_filled() {
            self.emit_status(out, &order);
        } else if order.is_limit_like() {
            if order.filled_amount.is_zero() {
                order.status = OrderStatus::Untouched;
            }
            self.emit_status(out, &order);
            self.rest(order.clone());
        } else {
            order.status = OrderStatus::Cancelled;
            self.emit_status(out, &order);
        }
        order
    }

    /// Park a stop order until the last price crosses its `stop_price`.
    pub fn park(&mut self, mut order: Order, out: &mut Vec<Event>) {
        order.status = OrderStatus::Untouched;
        self.emit_status(out, &order);
        self.stops.insert(order);
    }

    /// Next parked stop triggered by the current last price.
    pub fn take_triggered_stop(&mut self) -> Option<Order> {
        if self.last_price.is_zero() {
            return None;
        }
        self.stops.take_triggered(self.last_price)
    }

    /// Look up a resting or parked order.
    pub fn get(&self, id: u64) -> Option<&Order> {
        match self.resting.get(&id) {
            Some(&(side, price)) => self
                .levels(side)
                .get(&price)
                .and_then(|q| q.iter().find(|o| o.id == id)),
            None => self.stops.get(id),
        }
    }

    /// Mutable access to a resting order. Parked stops are not reachable.
    pub fn resting_mut(&mut self, id: u64) -> Option<&mut Order> {
        let &(side, price) = self.resting.get(&id)?;
        self.levels_mut(side)
            .get_mut(&price)
            .and_then(|q| q.iter_mut().find(|o| o.id == id))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.resting.contains_key(&id) || self.stops.contains(id)
    }

    /// Remove a resting or parked order without emitting anything.
    pub fn remove(&mut self, id: u64) -> Option<Order> {
        let Some((side, price)) = self.resting.remove(&id) else {
            return self.stops.remove(id);
        };
        let levels = self.levels_mut(side);
        let queue = levels.get_mut(&price)?;
        let pos = queue.iter().position(|o| o.id == id)?;
        let order = queue.remove(pos);
        if queue.is_empty() {
            levels.remove(&price);
        }
        order
    }

    /// Put a persisted open order back where it belongs.
    pub fn restore(&mut self, order: Order) {
        if order.stop != StopType::None {
            self.stops.insert(order);
        } else if order.is_limit_like() && !order.is_filled() {
            self.rest(order);
        }
    }

    /// Every resting and parked order: bids, then asks, then stops, each in
    /// priority order.
    pub fn open_orders(&self) -> Vec<Order> {
        self.bids
            .values()
            .rev()
            .chain(self.asks.values())
            .flat_map(|q| q.iter().cloned())
            .chain(self.stops.orders())
            .collect()
    }

    /// Drop every order; the sequencer and last price are kept.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.resting.clear();
        self.stops.clear();
    }

    pub fn best_bid_price(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask_price(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Total remaining amount resting at `price` on `side`.
    pub fn volume_at(&self, side: Side, price: Decimal) -> Decimal {
        self.levels(side)
            .get(&price)
            .map(|q| q.iter().map(Order::remaining_amount).sum::<Decimal>())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn resting_len(&self) -> usize {
        self.resting.len()
    }

    pub fn parked_len(&self) -> usize {
        self.stops.len()
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn levels(&self, side: Side) -> &BTreeMap<Decimal, VecDeque<Order>> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn levels_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, VecDeque<Order>> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn rest(&mut self, order: Order) {
        self.resting.insert(order.id, (order.side, order.price));
        self.levels_mut(order.side)
            .entry(order.price)
            .or_default()
            .push_back(order);
    }

    /// Match an incoming order against the opposite side of the book.
    ///
    /// Buys are additionally bounded by what is left of the bid's locked
    /// quote funds. A resting bid left with less than one unit's worth is
    /// cancelled where the sell meets it. Any remaining amount is left in
    /// `taker` for the caller.
    fn match_order(&mut self, taker: &mut Order, out: &mut Vec<Event>) {
        let OrderBook {
            market,
            bids,
            asks,
            resting,
            seq,
            last_price,
            now,
            ..
        } = self;
        let levels = match taker.side {
            Side::Buy => asks,
            Side::Sell => bids,
        };

        loop {
            if taker.remaining_amount() <= Decimal::ZERO {
                break;
            }

            let best = match taker.side {
                Side::Buy => levels.keys().next().copied(),
                Side::Sell => levels.keys().next_back().copied(),
            };
            let Some(price) = best else {
                break;
            };

            if taker.is_limit_like() {
                let crosses = match taker.side {
                    Side::Buy => taker.price >= price,
                    Side::Sell => taker.price <= price,
                };
                if !crosses {
                    break;
                }
            }

            let Some(queue) = levels.get_mut(&price) else {
                break;
            };

            let mut out_of_funds = false;
            while taker.remaining_amount() > Decimal::ZERO {
                let Some(maker) = queue.front_mut() else {
                    break;
                };

                let bid_funds = match taker.side {
                    Side::Buy => taker.remaining_funds(),
                    Side::Sell => maker.remaining_funds(),
                };
                let volume = taker
                    .remaining_amount()
                    .min(maker.remaining_amount())
                    .min(market.affordable_volume(bid_funds, price));
                if volume <= Decimal::ZERO {
                    if taker.side == Side::Buy {
                        out_of_funds = true;
                        break;
                    }
                    // a bid whose funds no longer buy one unit can never fill
                    if let Some(mut dust) = queue.pop_front() {
                        resting.remove(&dust.id);
                        dust.status = OrderStatus::Cancelled;
                        out.push(seq.event(
                            &market.id,
                            *now,
                            EventBody::OrderStatusChange { order: dust },
                        ));
                    }
                    continue;
                }

                let quote_volume = market.quote_volume(price, volume);
                let (bid_rate, ask_rate) = match taker.side {
                    Side::Buy => (taker.taker_fee_rate, maker.maker_fee_rate),
                    Side::Sell => (maker.maker_fee_rate, taker.taker_fee_rate),
                };
                let bid_fee = market.truncate_volume(volume * bid_rate);
                let ask_fee = market.truncate_quote(quote_volume * ask_rate);

                let (ask, bid) = match taker.side {
                    Side::Buy => {
                        taker.apply_fill(volume, quote_volume, bid_fee);
                        maker.apply_fill(volume, quote_volume, ask_fee);
                        (&*maker, &*taker)
                    }
                    Side::Sell => {
                        taker.apply_fill(volume, quote_volume, ask_fee);
                        maker.apply_fill(volume, quote_volume, bid_fee);
                        (&*taker, &*maker)
                    }
                };

                let trade_seq = seq.next_trade();
                let trade = Trade {
                    id: trade_seq,
                    seq_id: trade_seq,
                    market_id: market.id.clone(),
                    ask_order_id: ask.id,
                    ask_owner_id: ask.owner_id,
                    ask_sub_account_id: ask.sub_account_id,
                    bid_order_id: bid.id,
                    bid_owner_id: bid.owner_id,
                    bid_sub_account_id: bid.sub_account_id,
                    volume,
                    quote_volume,
                    price,
                    ask_fee_amount: ask_fee,
                    bid_fee_amount: bid_fee,
                    taker_side: taker.side,
                    self_trade: ask.owner_id == bid.owner_id,
                    created_at: *now,
                };
                let body = EventBody::NewTrade(NewTrade {
                    trade,
                    ask_order: ask.clone(),
                    bid_order: bid.clone(),
                });
                out.push(seq.event(&market.id, *now, body));

                let maker_done = maker.is_filled();
                let maker_snapshot = maker.clone();
                out.push(seq.event(
                    &market.id,
                    *now,
                    EventBody::OrderStatusChange { order: maker_snapshot },
                ));
                *last_price = price;

                if maker_done {
                    if let Some(done) = queue.pop_front() {
                        resting.remove(&done.id);
                    }
                }
            }

            if queue.is_empty() {
                levels.remove(&price);
            }
            if out_of_funds {
                break;
            }
        }
    }
}
