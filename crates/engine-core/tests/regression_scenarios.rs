// crates/engine-core/tests/regression_scenarios.rs
use engine_core::{
    Decimal, Event, EventBody, Market, MatchingEngine, Order, OrderCommand, OrderStatus, OrderType, OtoType,
    Side, StopType, TsPriceType,
};
use rust_decimal_macros::dec;

fn btcusdt() -> Market {
    let mut m = Market::new("btcusdt", "btc", "usdt", 8, 8);
    m.min_market_volume = dec!(0.0001);
    m
}

fn engine() -> MatchingEngine {
    MatchingEngine::new(btcusdt())
}

/// A limit order with the lock the order queue would have taken.
fn limit(id: u64, owner: u64, side: Side, price: Decimal, amount: Decimal) -> Order {
    let mut o = Order::new(id, "btcusdt", side, OrderType::Limit, price, amount);
    o.owner_id = owner;
    o.sub_account_id = 1;
    o.locked_funds = match side {
        Side::Buy => price * amount,
        Side::Sell => amount,
    };
    o
}

fn submit(engine: &mut MatchingEngine, order: Order) -> Vec<Event> {
    engine.process_at(OrderCommand::new_order(order), 1)
}

fn statuses(events: &[Event], id: u64) -> Vec<OrderStatus> {
    events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::OrderStatusChange { order } if order.id == id => Some(order.status),
            _ => None,
        })
        .collect()
}

fn last_snapshot(events: &[Event], id: u64) -> Option<Order> {
    events
        .iter()
        .rev()
        .filter_map(|e| match &e.body {
            EventBody::OrderStatusChange { order } | EventBody::OrderActivation { order } if order.id == id => {
                Some(order.clone())
            }
            _ => None,
        })
        .next()
}

fn activated(events: &[Event], id: u64) -> bool {
    events
        .iter()
        .any(|e| matches!(&e.body, EventBody::OrderActivation { order } if order.id == id))
}

#[test]
fn simple_match() {
    let mut e = engine();

    let first = submit(&mut e, limit(1, 100, Side::Sell, dec!(20000), dec!(0.5)));
    assert_eq!(first.len(), 1);
    assert_eq!(statuses(&first, 1), vec![OrderStatus::Untouched]);

    let seq_before = e.event_seq();
    let events = submit(&mut e, limit(2, 200, Side::Buy, dec!(20000), dec!(0.5)));
    assert_eq!(events.len(), 3);

    let trade = &events[0].trade().expect("trade first").trade;
    assert_eq!(trade.volume, dec!(0.5));
    assert_eq!(trade.quote_volume, dec!(10000));
    assert_eq!(trade.price, dec!(20000));
    assert_eq!(trade.taker_side, Side::Buy);
    assert!(!trade.self_trade);

    assert_eq!(statuses(&events, 1), vec![OrderStatus::Filled]);
    assert_eq!(statuses(&events, 2), vec![OrderStatus::Filled]);
    assert_eq!(e.event_seq() - seq_before, 3);
    assert_eq!(e.trade_seq(), 1);
    assert!(e.open_orders().is_empty());
}

#[test]
fn partial_fill_then_cancel() {
    let mut e = engine();
    submit(&mut e, limit(1, 100, Side::Sell, dec!(21000), dec!(1)));
    let events = submit(&mut e, limit(2, 200, Side::Buy, dec!(21000), dec!(0.3)));

    assert_eq!(events.iter().filter(|ev| ev.trade().is_some()).count(), 1);
    assert_eq!(statuses(&events, 1), vec![OrderStatus::PartiallyFilled]);

    let cancelled = e.process_at(OrderCommand::cancel("btcusdt", 1, 100), 2);
    let order = last_snapshot(&cancelled, 1).expect("cancel snapshot");
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.filled_amount, dec!(0.3));
    assert_eq!(order.remaining_funds(), dec!(0.7));

    let again = e.process_at(OrderCommand::cancel("btcusdt", 1, 100), 3);
    assert_eq!(again[0].error().map(|err| err.code), Some(engine_core::ErrorCode::CancelFailed));
}

#[test]
fn market_buy_over_lock_leaves_residual() {
    let mut e = engine();
    submit(&mut e, limit(1, 100, Side::Sell, dec!(20000), dec!(1)));

    let mut buy = Order::new(2, "btcusdt", Side::Buy, OrderType::Market, dec!(0), dec!(0.1));
    buy.owner_id = 200;
    buy.funds = dec!(3000);
    buy.locked_funds = dec!(2200);
    let events = submit(&mut e, buy);

    let done = last_snapshot(&events, 2).expect("taker status");
    assert_eq!(done.status, OrderStatus::Filled);
    assert_eq!(done.used_funds, dec!(2000));
    assert_eq!(done.remaining_funds(), dec!(200));
    assert_eq!(e.book().volume_at(Side::Sell, dec!(20000)), dec!(0.9));
}

#[test]
fn self_trade_is_flagged() {
    let mut e = engine();
    submit(&mut e, limit(1, 100, Side::Sell, dec!(100), dec!(1)));
    let events = submit(&mut e, limit(2, 100, Side::Buy, dec!(100), dec!(1)));
    let trade = &events[0].trade().expect("trade").trade;
    assert!(trade.self_trade);
    assert_eq!(trade.ask_owner_id, trade.bid_owner_id);
}

#[test]
fn stop_loss_fires_after_trade_crosses() {
    let mut e = engine();
    submit(&mut e, limit(1, 100, Side::Buy, dec!(94), dec!(2)));

    let mut stop = Order::new(2, "btcusdt", Side::Sell, OrderType::Market, dec!(0), dec!(1));
    stop.owner_id = 200;
    stop.stop = StopType::Loss;
    stop.stop_price = dec!(95);
    stop.funds = dec!(1);
    stop.locked_funds = dec!(1);
    let parked = submit(&mut e, stop);
    assert_eq!(statuses(&parked, 2), vec![OrderStatus::Untouched]);
    assert_eq!(e.book().parked_len(), 1);

    let events = submit(&mut e, limit(3, 300, Side::Sell, dec!(94), dec!(0.5)));
    assert!(activated(&events, 2));
    assert_eq!(last_snapshot(&events, 2).map(|o| o.status), Some(OrderStatus::Filled));
    assert_eq!(e.book().volume_at(Side::Buy, dec!(94)), dec!(0.5));
    assert_eq!(e.book().parked_len(), 0);
}

fn oco_sell(id: u64) -> Order {
    let mut o = Order::new(id, "btcusdt", Side::Sell, OrderType::Oco, dec!(110), dec!(1));
    o.owner_id = 500;
    o.stop_price = dec!(90);
    o.sl_order_id = id + 1;
    o.locked_funds = dec!(1);
    o
}

#[test]
fn oco_stop_leg_takes_over_the_lock() {
    let mut e = engine();
    submit(&mut e, oco_sell(10));
    submit(&mut e, limit(1, 100, Side::Buy, dec!(89), dec!(2)));

    let events = submit(&mut e, limit(3, 300, Side::Sell, dec!(89), dec!(0.5)));
    let parent = last_snapshot(&events, 10).expect("parent cancelled");
    assert_eq!(parent.status, OrderStatus::Cancelled);
    assert_eq!(parent.remaining_funds(), dec!(0));

    assert!(activated(&events, 11));
    let leg = last_snapshot(&events, 11).expect("leg");
    assert_eq!(leg.status, OrderStatus::Filled);
    assert_eq!(leg.locked_funds, dec!(1));
    assert_eq!(leg.parent_order_id, 10);
    assert_eq!(e.book().best_ask_price(), None);
}

#[test]
fn oco_fill_retires_stop_leg() {
    let mut e = engine();
    submit(&mut e, oco_sell(10));
    let events = submit(&mut e, limit(2, 200, Side::Buy, dec!(110), dec!(0.4)));
    assert_eq!(statuses(&events, 11), vec![OrderStatus::Cancelled]);

    // The stop leg is gone: trading through the stop no longer fires it.
    submit(&mut e, limit(3, 300, Side::Buy, dec!(80), dec!(1)));
    let later = submit(&mut e, limit(4, 400, Side::Sell, dec!(80), dec!(0.1)));
    assert!(!activated(&later, 11));
    assert_eq!(e.book().volume_at(Side::Sell, dec!(110)), dec!(0.6));
}

#[test]
fn oto_take_profit_follows_filled_parent() {
    let mut e = engine();
    submit(&mut e, limit(1, 100, Side::Sell, dec!(100), dec!(1)));

    let mut parent = Order::new(20, "btcusdt", Side::Buy, OrderType::Oto, dec!(100), dec!(1));
    parent.owner_id = 600;
    parent.oto_type = Some(OtoType::TakeProfit);
    parent.tp_order_id = 21;
    parent.tp_price = dec!(120);
    parent.taker_fee_rate = dec!(0.001);
    parent.locked_funds = dec!(100);
    let events = submit(&mut e, parent);

    assert_eq!(statuses(&events, 20), vec![OrderStatus::Filled]);
    let leg = last_snapshot(&events, 21).expect("follow-up admitted");
    assert_eq!(leg.status, OrderStatus::Untouched);
    assert_eq!(leg.side, Side::Sell);
    assert_eq!(leg.init_order_id, 20);
    assert_eq!(leg.locked_funds, dec!(0.999));
    assert_eq!(e.book().volume_at(Side::Sell, dec!(120)), dec!(0.999));
}

#[test]
fn strangle_fires_one_leg_and_cancels_the_other() {
    let mut e = engine();
    let mut parent = Order::new(30, "btcusdt", Side::Buy, OrderType::Strangle, dec!(0), dec!(1));
    parent.owner_id = 700;
    parent.tp_order_id = 31;
    parent.sl_order_id = 32;
    parent.tp_price = dec!(110);
    parent.sl_price = dec!(90);
    parent.locked_funds = dec!(120);
    parent.opposite_locked_funds = dec!(1);
    let admitted = submit(&mut e, parent);
    assert_eq!(statuses(&admitted, 30), vec![OrderStatus::Untouched]);

    submit(&mut e, limit(1, 100, Side::Sell, dec!(111), dec!(2)));
    let events = submit(&mut e, limit(2, 200, Side::Buy, dec!(111), dec!(0.5)));

    assert_eq!(statuses(&events, 32), vec![OrderStatus::Cancelled]);
    assert!(activated(&events, 31));
    let leg = last_snapshot(&events, 31).expect("buy leg");
    assert_eq!(leg.status, OrderStatus::Filled);
    assert_eq!(leg.used_funds, dec!(111));

    let parent = last_snapshot(&events, 30).expect("parent mirror");
    assert_eq!(parent.status, OrderStatus::Filled);
    assert_eq!(parent.tp_status, OrderStatus::Filled);
    assert_eq!(parent.sl_status, OrderStatus::Cancelled);
    assert!(e.open_orders().iter().all(|o| o.id != 30));
}

#[test]
fn cancelling_a_strangle_releases_both_legs() {
    let mut e = engine();
    let mut parent = Order::new(30, "btcusdt", Side::Buy, OrderType::Strangle, dec!(0), dec!(1));
    parent.owner_id = 700;
    parent.tp_order_id = 31;
    parent.sl_order_id = 32;
    parent.tp_price = dec!(110);
    parent.sl_price = dec!(90);
    parent.locked_funds = dec!(120);
    parent.opposite_locked_funds = dec!(1);
    submit(&mut e, parent);

    let events = e.process_at(OrderCommand::cancel("btcusdt", 32, 700), 2);
    assert_eq!(statuses(&events, 31), vec![OrderStatus::Cancelled]);
    assert_eq!(statuses(&events, 32), vec![OrderStatus::Cancelled]);
    assert_eq!(statuses(&events, 30), vec![OrderStatus::Cancelled]);
    assert!(e.open_orders().is_empty());
}

#[test]
fn trailing_stop_follows_the_high() {
    let mut e = engine();
    let mut ts = Order::new(40, "btcusdt", Side::Sell, OrderType::TrailingStop, dec!(0), dec!(1));
    ts.owner_id = 800;
    ts.ts_price = dec!(5);
    ts.ts_price_type = TsPriceType::Absolute;
    ts.locked_funds = dec!(1);
    submit(&mut e, ts);

    submit(&mut e, limit(1, 100, Side::Sell, dec!(100), dec!(1)));
    submit(&mut e, limit(2, 200, Side::Buy, dec!(100), dec!(1)));
    submit(&mut e, limit(3, 100, Side::Sell, dec!(110), dec!(1)));
    let up = submit(&mut e, limit(4, 200, Side::Buy, dec!(110), dec!(1)));
    let tracked = last_snapshot(&up, 40).expect("reference moved");
    assert_eq!(tracked.ts_reference_price, dec!(110));
    assert_eq!(tracked.stop_price, dec!(105));
    assert!(!activated(&up, 40));

    submit(&mut e, limit(5, 200, Side::Buy, dec!(104), dec!(3)));
    let down = submit(&mut e, limit(6, 100, Side::Sell, dec!(104), dec!(1)));
    assert!(activated(&down, 40));
    assert_eq!(last_snapshot(&down, 40).map(|o| o.status), Some(OrderStatus::Filled));
    assert_eq!(e.book().volume_at(Side::Buy, dec!(104)), dec!(1));
}

#[test]
fn load_and_replay_reproduce_state() {
    let mut live = engine();
    let mut log = Vec::new();
    log.extend(submit(&mut live, limit(1, 100, Side::Sell, dec!(105), dec!(2))));
    log.extend(submit(&mut live, oco_sell(10)));
    log.extend(submit(&mut live, limit(2, 200, Side::Buy, dec!(105), dec!(0.5))));
    log.extend(submit(&mut live, limit(3, 200, Side::Buy, dec!(95), dec!(1))));
    log.extend(live.process_at(OrderCommand::cancel("btcusdt", 3, 200), 2));
    log.extend(submit(&mut live, limit(4, 300, Side::Buy, dec!(96), dec!(1))));

    // Checkpoint after the first three events, replay the rest.
    let mut checkpoint = engine();
    let (head, tail) = log.split_at(3);
    checkpoint.replay(head);
    let store = checkpoint.open_orders();
    let (event_seq, trade_seq) = (checkpoint.event_seq(), checkpoint.trade_seq());

    let mut restored = engine();
    restored.load(store, event_seq, trade_seq);
    restored.replay(tail);
    restored.replay(tail);

    assert_eq!(restored.event_seq(), live.event_seq());
    assert_eq!(restored.trade_seq(), live.trade_seq());

    let ids = |e: &MatchingEngine| {
        let mut ids: Vec<u64> = e.open_orders().iter().map(|o| o.id).collect();
        ids.sort_unstable();
        ids
    };
    assert_eq!(ids(&restored), ids(&live));
    assert_eq!(ids(&live), vec![1, 4, 10]);

    // The restored OCO still fires its stop leg.
    let next = submit(&mut restored, limit(5, 400, Side::Sell, dec!(89), dec!(1)));
    println!("restored engine produced {} events", next.len());
    assert!(next.iter().any(|ev| ev.trade().is_some()));
    let mut sell_down = submit(&mut restored, limit(6, 401, Side::Buy, dec!(80), dec!(1)));
    sell_down.extend(submit(&mut restored, limit(7, 402, Side::Sell, dec!(80), dec!(0.1))));
    assert!(activated(&sell_down, 11));
}
