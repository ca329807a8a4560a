//! State machines for composite orders.
//!
//! Composite orders sit above the primitive book. Each one is tracked as
//! a [`Composite`] variant and advanced by two inputs only: the events
//! the book emits ([`Composites::react`]) and the last trade price
//! ([`Composites::take_triggered`]). The tracker never touches the book
//! itself; it hands back [`Reaction`]s and [`Trigger`]s that the
//! [`MatchingEngine`](crate::MatchingEngine) carries out.
//!
//! | type          | parent                         | legs                                   |
//! |---------------|--------------------------------|----------------------------------------|
//! | oco           | rests as a limit at `price`    | stop leg parked at `stop_price`        |
//! | oto           | rests as a limit at `price`    | follow-up admitted when parent is done |
//! | strangle      | virtual                        | buy leg at `tp_price`, sell at `sl_price` |
//! | straddle      | virtual                        | both legs at one price, strict trigger |
//! | trailing_stop | parked, tracks best price      | none                                   |

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;

use crate::market::Market;
use crate::messages::{Event, EventBody};
use crate::order::Order;
use crate::order_type::{OrderType, OtoType, StopType, TsPriceType};
use crate::side::Side;
use crate::status::OrderStatus;

#[derive(Debug, Clone)]
enum Composite {
    /// The parent rests in the book under its own id.
    Oco { leg: Order },
    /// The parent rests in the book; nothing else to remember.
    Oto,
    Pair {
        parent: Order,
        buy_leg: Order,
        sell_leg: Order,
    },
    Trailing { order: Order, tracking: bool },
}

/// Something the engine must do in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Emit a `cancelled` status for this never-resting leg.
    Cancelled(Order),
    /// Emit a fresh snapshot (a trailing stop moved its reference).
    Updated(Order),
    /// Admit this follow-up leg as a plain order.
    Admit(Order),
}

/// A parked composite part whose trigger condition holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Cancel the resting parent, move its lock onto `leg`, run `leg`.
    OcoStop { parent_id: u64, leg: Order },
    /// Cancel `sibling`, run `leg`, mirror its outcome onto `parent`.
    PairLeg { parent: Order, leg: Order, sibling: Order },
    /// Run the trailing stop as a market order.
    Trailing { order: Order },
}

/// What a cancel of a composite id tore down.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CancelPlan {
    /// Snapshots to emit as cancelled, already marked `cancelled`.
    pub cancelled: Vec<Order>,
    /// Resting parent the engine must also pull from the book.
    pub book_order: Option<u64>,
}

/// Composite tracker of one market.
#[derive(Debug, Default)]
pub struct Composites {
    /// Keyed by parent id; ids grow with admission so iteration is in
    /// admission order.
    by_parent: BTreeMap<u64, Composite>,
    /// Parked leg id -> parent id.
    legs: HashMap<u64, u64>,
}

impl Composites {
    pub fn new() -> Self {
        Composites::default()
    }

    pub fn len(&self) -> usize {
        self.by_parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_parent.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.by_parent.contains_key(&id) || self.legs.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.by_parent.clear();
        self.legs.clear();
    }

    /// Start tracking an OCO parent that is about to be put on the book.
    pub fn track_oco(&mut self, parent: &Order) {
        let leg = oco_stop_leg(parent);
        self.legs.insert(leg.id, parent.id);
        self.by_parent.insert(parent.id, Composite::Oco { leg });
    }

    pub fn track_oto(&mut self, parent_id: u64) {
        self.by_parent.insert(parent_id, Composite::Oto);
    }

    /// Start tracking a strangle or straddle parent and park its two legs.
    pub fn track_pair(&mut self, parent: Order) {
        let (buy_leg, sell_leg) = pair_legs(&parent);
        self.legs.insert(buy_leg.id, parent.id);
        self.legs.insert(sell_leg.id, parent.id);
        self.by_parent.insert(
            parent.id,
            Composite::Pair {
                parent,
                buy_leg,
                sell_leg,
            },
        );
    }

    /// Park a trailing stop. With no activation price it starts tracking
    /// right away from `last_price` (when there is one). Returns the
    /// snapshot to publish.
    pub fn track_trailing(&mut self, mut order: Order, last_price: Decimal) -> Order {
        let mut tracking = !order.ts_reference_price.is_zero();
        if !tracking && order.ts_activation_price.is_zero() && !last_price.is_zero() {
            tracking = true;
            order.ts_reference_price = last_price;
            order.stop_price = trailing_stop_price(&order, last_price);
        }
        self.by_parent.insert(
            order.id,
            Composite::Trailing {
                order: order.clone(),
                tracking,
            },
        );
        order
    }

    /// The order a cancel of `id` would act on, for the owner check.
    pub fn find(&self, id: u64) -> Option<&Order> {
        let parent_id = self.legs.get(&id).copied().unwrap_or(id);
        match self.by_parent.get(&parent_id)? {
            Composite::Oco { leg } => Some(leg),
            Composite::Oto => None,
            Composite::Pair { parent, .. } => Some(parent),
            Composite::Trailing { order, .. } => Some(order),
        }
    }

    /// Non-book open orders: virtual parents and parked trailing stops.
    pub fn open_orders(&self) -> Vec<Order> {
        self.by_parent
            .values()
            .filter_map(|c| match c {
                Composite::Pair { parent, .. } => Some(parent.clone()),
                Composite::Trailing { order, .. } => Some(order.clone()),
                _ => None,
            })
            .collect()
    }

    /// Advance the state machines over one emitted event.
    pub fn react(&mut self, event: &Event, market: &Market) -> Vec<Reaction> {
        let mut reactions = Vec::new();
        match &event.body {
            EventBody::NewTrade(t) => self.track_price(t.trade.price, &mut reactions),
            EventBody::OrderStatusChange { order } => {
                let (is_oco, is_oto) = match self.by_parent.get(&order.id) {
                    Some(Composite::Oco { .. }) => (true, false),
                    Some(Composite::Oto) => (false, true),
                    _ => (false, false),
                };
                if is_oco && (!order.filled_amount.is_zero() || order.status.is_terminal()) {
                    // Any fill on the parent retires the stop leg.
                    if let Some(Composite::Oco { leg }) = self.untrack(order.id) {
                        reactions.push(Reaction::Cancelled(cancelled(leg)));
                    }
                } else if is_oto && order.status.is_terminal() {
                    self.untrack(order.id);
                    if !order.filled_amount.is_zero() {
                        let leg = oto_follow_up(order, market);
                        if leg.amount > Decimal::ZERO {
                            reactions.push(Reaction::Admit(leg));
                        } else {
                            reactions.push(Reaction::Cancelled(cancelled(leg)));
                        }
                    }
                }
            }
            _ => {}
        }
        reactions
    }

    /// Remove and return the first parked part whose condition holds at
    /// `last_price`, in parent admission order.
    pub fn take_triggered(&mut self, last_price: Decimal) -> Option<Trigger> {
        if last_price.is_zero() {
            return None;
        }
        let parent_id = self
            .by_parent
            .iter()
            .find(|(_, c)| is_triggered(c, last_price))
            .map(|(id, _)| *id)?;

        match self.untrack(parent_id)? {
            Composite::Oco { leg } => Some(Trigger::OcoStop { parent_id, leg }),
            Composite::Pair {
                parent,
                buy_leg,
                sell_leg,
            } => {
                if pair_buy_triggered(&parent, last_price) {
                    Some(Trigger::PairLeg {
                        parent,
                        leg: buy_leg,
                        sibling: sell_leg,
                    })
                } else {
                    Some(Trigger::PairLeg {
                        parent,
                        leg: sell_leg,
                        sibling: buy_leg,
                    })
                }
            }
            Composite::Trailing { order, .. } => Some(Trigger::Trailing { order }),
            Composite::Oto => None,
        }
    }

    /// Tear down the composite owning `id` (a parent or a parked leg).
    ///
    /// OTO parents are ordinary resting orders and are cancelled through
    /// the book, so they yield `None` here.
    pub fn cancel(&mut self, id: u64) -> Option<CancelPlan> {
        let parent_id = self.legs.get(&id).copied().unwrap_or(id);
        if matches!(self.by_parent.get(&parent_id), Some(Composite::Oto) | None) {
            return None;
        }
        let plan = match self.untrack(parent_id)? {
            Composite::Oco { leg } => CancelPlan {
                cancelled: vec![cancelled(leg)],
                book_order: Some(parent_id),
            },
            Composite::Pair {
                mut parent,
                buy_leg,
                sell_leg,
            } => {
                parent.tp_status = OrderStatus::Cancelled;
                parent.sl_status = OrderStatus::Cancelled;
                CancelPlan {
                    cancelled: vec![cancelled(buy_leg), cancelled(sell_leg), cancelled(parent)],
                    book_order: None,
                }
            }
            Composite::Trailing { order, .. } => CancelPlan {
                cancelled: vec![cancelled(order)],
                book_order: None,
            },
            Composite::Oto => return None,
        };
        Some(plan)
    }

    fn untrack(&mut self, parent_id: u64) -> Option<Composite> {
        let composite = self.by_parent.remove(&parent_id)?;
        match &composite {
            Composite::Oco { leg } => {
                self.legs.remove(&leg.id);
            }
            Composite::Pair { buy_leg, sell_leg, .. } => {
                self.legs.remove(&buy_leg.id);
                self.legs.remove(&sell_leg.id);
            }
            _ => {}
        }
        Some(composite)
    }

    fn track_price(&mut self, price: Decimal, reactions: &mut Vec<Reaction>) {
        for composite in self.by_parent.values_mut() {
            let Composite::Trailing { order, tracking } = composite else {
                continue;
            };
            let reference = if *tracking {
                match order.side {
                    Side::Sell => order.ts_reference_price.max(price),
                    Side::Buy => order.ts_reference_price.min(price),
                }
            } else {
                let activated = order.ts_activation_price.is_zero()
                    || match order.side {
                        Side::Sell => price >= order.ts_activation_price,
                        Side::Buy => price <= order.ts_activation_price,
                    };
                if !activated {
                    continue;
                }
                *tracking = true;
                price
            };
            if reference != order.ts_reference_price {
                order.ts_reference_price = reference;
                order.stop_price = trailing_stop_price(order, reference);
                reactions.push(Reaction::Updated(order.clone()));
            }
        }
    }
}

fn is_triggered(composite: &Composite, last_price: Decimal) -> bool {
    match composite {
        Composite::Oco { leg } => leg.stop.is_triggered(leg.stop_price, last_price),
        Composite::Oto => false,
        Composite::Pair { parent, .. } => {
            pair_buy_triggered(parent, last_price) || pair_sell_triggered(parent, last_price)
        }
        Composite::Trailing { order, tracking } => {
            *tracking
                && match order.side {
                    Side::Sell => last_price <= order.stop_price,
                    Side::Buy => last_price >= order.stop_price,
                }
        }
    }
}

fn pair_buy_triggered(parent: &Order, last_price: Decimal) -> bool {
    match parent.order_type {
        OrderType::Straddle => last_price > parent.tp_price,
        _ => last_price >= parent.tp_price,
    }
}

fn pair_sell_triggered(parent: &Order, last_price: Decimal) -> bool {
    match parent.order_type {
        OrderType::Straddle => last_price < parent.sl_price,
        _ => last_price <= parent.sl_price,
    }
}

/// Stop price of a trailing stop whose best observed price is `reference`.
pub fn trailing_stop_price(order: &Order, reference: Decimal) -> Decimal {
    let offset = match order.ts_price_type {
        TsPriceType::Absolute => order.ts_price,
        TsPriceType::Percentage => reference * order.ts_price / Decimal::ONE_HUNDRED,
    };
    match order.side {
        Side::Sell => (reference - offset).max(Decimal::ZERO),
        Side::Buy => reference + offset,
    }
}

fn cancelled(mut order: Order) -> Order {
    order.status = OrderStatus::Cancelled;
    order
}

fn leg_of(parent: &Order, id: u64, side: Side) -> Order {
    Order {
        id,
        market_id: parent.market_id.clone(),
        owner_id: parent.owner_id,
        sub_account_id: parent.sub_account_id,
        side,
        maker_fee_rate: parent.maker_fee_rate,
        taker_fee_rate: parent.taker_fee_rate,
        parent_order_id: parent.id,
        init_order_id: parent.id,
        created_at: parent.created_at,
        ..Order::default()
    }
}

/// The parked stop leg of an OCO parent. It carries no lock until it
/// fires and takes over the parent's.
pub fn oco_stop_leg(parent: &Order) -> Order {
    let mut leg = leg_of(parent, parent.sl_order_id, parent.side);
    leg.order_type = if parent.sl_price.is_zero() {
        OrderType::Market
    } else {
        OrderType::Limit
    };
    leg.stop = match parent.side {
        Side::Sell => StopType::Loss,
        Side::Buy => StopType::Entry,
    };
    leg.stop_price = parent.stop_price;
    leg.price = parent.sl_price;
    leg.amount = if parent.sl_amount.is_zero() {
        parent.amount
    } else {
        parent.sl_amount.min(parent.amount)
    };
    leg
}

/// The two market legs of a strangle / straddle parent.
pub fn pair_legs(parent: &Order) -> (Order, Order) {
    let mut buy = leg_of(parent, parent.tp_order_id, Side::Buy);
    buy.order_type = OrderType::Market;
    buy.stop = StopType::Entry;
    buy.stop_price = parent.tp_price;
    buy.price = parent.tp_price;
    buy.amount = if parent.tp_amount.is_zero() {
        parent.amount
    } else {
        parent.tp_amount
    };
    buy.locked_funds = parent.locked_funds;
    buy.funds = parent.locked_funds;
    buy.status = parent.tp_status;

    let mut sell = leg_of(parent, parent.sl_order_id, Side::Sell);
    sell.order_type = OrderType::Market;
    sell.stop = StopType::Loss;
    sell.stop_price = parent.sl_price;
    sell.price = parent.sl_price;
    let wanted = if parent.sl_amount.is_zero() {
        parent.amount
    } else {
        parent.sl_amount
    };
    sell.amount = wanted.min(parent.opposite_locked_funds);
    sell.locked_funds = parent.opposite_locked_funds;
    sell.funds = parent.opposite_locked_funds;
    sell.status = parent.sl_status;
    (buy, sell)
}

/// The follow-up leg of a finished OTO parent, sized by its reserved net
/// proceeds. An amount of zero means nothing can be placed.
pub fn oto_follow_up(parent: &Order, market: &Market) -> Order {
    let proceeds = parent.net_proceeds().max(Decimal::ZERO);
    let side = parent.side.opposite();
    let (id, price, cap) = match parent.oto_type {
        Some(OtoType::StopLoss) => (parent.sl_order_id, parent.sl_price, parent.sl_amount),
        _ => (parent.tp_order_id, parent.tp_price, parent.tp_amount),
    };

    let mut leg = leg_of(parent, id, side);
    match parent.oto_type {
        Some(OtoType::StopLoss) => {
            leg.order_type = OrderType::Market;
            leg.stop = match side {
                Side::Sell => StopType::Loss,
                Side::Buy => StopType::Entry,
            };
            leg.stop_price = price;
        }
        _ => leg.order_type = OrderType::Limit,
    }
    leg.price = price;
    leg.locked_funds = proceeds;
    leg.funds = proceeds;

    let affordable = match side {
        Side::Sell => market.truncate_volume(proceeds),
        Side::Buy => market.affordable_volume(proceeds, price),
    };
    leg.amount = if cap.is_zero() { affordable } else { cap.min(affordable) };
    leg
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market() -> Market {
        Market::new("btcusdt", "btc", "usdt", 8, 8)
    }

    fn trailing(side: Side, ts_price: Decimal, ts_type: TsPriceType) -> Order {
        let mut o = Order::new(10, "btcusdt", side, OrderType::TrailingStop, dec!(0), dec!(1));
        o.ts_price = ts_price;
        o.ts_price_type = ts_type;
        o
    }

    #[test]
    fn trailing_stop_price_follows_side() {
        let sell = trailing(Side::Sell, dec!(5), TsPriceType::Percentage);
        assert_eq!(trailing_stop_price(&sell, dec!(200)), dec!(190));
        let buy = trailing(Side::Buy, dec!(3), TsPriceType::Absolute);
        assert_eq!(trailing_stop_price(&buy, dec!(100)), dec!(103));
    }

    #[test]
    fn oto_follow_up_for_buy_parent_sells_net_base() {
        let mut parent = Order::new(1, "btcusdt", Side::Buy, OrderType::Oto, dec!(100), dec!(2));
        parent.oto_type = Some(OtoType::TakeProfit);
        parent.tp_order_id = 2;
        parent.tp_price = dec!(120);
        parent.filled_amount = dec!(2);
        parent.fee_amount = dec!(0.002);
        let leg = oto_follow_up(&parent, &market());
        assert_eq!(leg.side, Side::Sell);
        assert_eq!(leg.order_type, OrderType::Limit);
        assert_eq!(leg.amount, dec!(1.998));
        assert_eq!(leg.locked_funds, dec!(1.998));
        assert_eq!(leg.init_order_id, 1);
    }

    #[test]
    fn oto_follow_up_for_sell_parent_buys_with_quote() {
        let mut parent = Order::new(1, "btcusdt", Side::Sell, OrderType::Oto, dec!(100), dec!(1));
        parent.oto_type = Some(OtoType::StopLoss);
        parent.sl_order_id = 3;
        parent.sl_price = dec!(125);
        parent.filled_amount = dec!(1);
        parent.filled_quote = dec!(100);
        parent.fee_amount = dec!(0);
        let leg = oto_follow_up(&parent, &market());
        assert_eq!(leg.side, Side::Buy);
        assert_eq!(leg.stop, StopType::Entry);
        assert_eq!(leg.amount, dec!(0.8));
        assert_eq!(leg.locked_funds, dec!(100));
    }

    #[test]
    fn straddle_triggers_strictly() {
        let mut parent = Order::new(1, "btcusdt", Side::Buy, OrderType::Straddle, dec!(0), dec!(1));
        parent.tp_order_id = 2;
        parent.sl_order_id = 3;
        parent.tp_price = dec!(100);
        parent.sl_price = dec!(100);
        parent.opposite_locked_funds = dec!(1);
        let mut c = Composites::new();
        c.track_pair(parent);
        assert!(c.take_triggered(dec!(100)).is_none());
        match c.take_triggered(dec!(99)) {
            Some(Trigger::PairLeg { leg, sibling, .. }) => {
                assert_eq!(leg.id, 3);
                assert_eq!(sibling.id, 2);
            }
            other => panic!("unexpected trigger {other:?}"),
        }
        assert!(c.is_empty());
        assert!(!c.contains(2));
    }

    #[test]
    fn cancelling_a_parked_oco_leg_pulls_the_parent() {
        let mut parent = Order::new(1, "btcusdt", Side::Sell, OrderType::Oco, dec!(110), dec!(1));
        parent.stop_price = dec!(90);
        parent.sl_order_id = 2;
        let mut c = Composites::new();
        c.track_oco(&parent);
        let plan = c.cancel(2).expect("plan");
        assert_eq!(plan.book_order, Some(1));
        assert_eq!(plan.cancelled[0].id, 2);
        assert_eq!(plan.cancelled[0].status, OrderStatus::Cancelled);
        assert!(c.cancel(1).is_none());
    }
}
