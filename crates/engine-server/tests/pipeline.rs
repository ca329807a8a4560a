// crates/engine-server/tests/pipeline.rs
use std::sync::Arc;
use std::time::Duration;

use engine_core::{
    CancelOutcome, Decimal, ErrorCode, ErrorEvent, Event, EventBody, Order, OrderError, OrderStatus, OrderType, Side,
    MAX_MAGNITUDE,
};
use engine_funds::{Balance, FundsOperation};
use engine_server::error::CancelError;
use engine_server::ledger::MemoryLedger;
use engine_server::order_store::MemoryOrderStore;
use engine_server::publisher::{EventPublisher, MemoryPublisher};
use engine_server::sequence::{event_key, trade_key, MemorySequenceStore};
use engine_server::{Backends, Config, ExchangeConfig, QueueError, TradingCore};
use rust_decimal_macros::dec;

const A: u64 = 100;
const B: u64 = 200;
const C: u64 = 300;
const REVENUE: u64 = 1;

fn exchange(maker: &str, taker: &str) -> ExchangeConfig {
    market_exchange(maker, taker, "active")
}

fn market_exchange(maker: &str, taker: &str, status: &str) -> ExchangeConfig {
    ExchangeConfig::from_toml_str(&format!(
        r#"
        [[markets]]
        id = "btcusdt"
        market_coin = "btc"
        quote_coin = "usdt"
        market_precision = 8
        quote_precision = 8
        min_market_volume = "0.0001"
        status = "{status}"

        [fees]
        maker_rate = "{maker}"
        taker_rate = "{taker}"
        revenue_user_id = {REVENUE}
        revenue_sub_account_id = 0

        [[reference_prices]]
        market = "btcusdt"
        price = "20000"
        "#
    ))
    .unwrap()
}

fn config() -> Config {
    Config {
        snapshot_interval: Duration::from_millis(50),
        cancel_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

struct Harness {
    core: TradingCore,
    publisher: Arc<MemoryPublisher>,
}

async fn start(exchange: ExchangeConfig, sequences: MemorySequenceStore, publisher: Arc<MemoryPublisher>) -> Harness {
    let backends = Backends {
        sequences: Arc::new(sequences),
        publisher: publisher.clone(),
        orders: Arc::new(MemoryOrderStore::new()),
        ledger: Arc::new(MemoryLedger::new()),
    };
    launch(exchange, backends, publisher).await
}

async fn launch(exchange: ExchangeConfig, backends: Backends, publisher: Arc<MemoryPublisher>) -> Harness {
    let core = TradingCore::start_with(&config(), exchange, backends).await.unwrap();
    Harness { core, publisher }
}

/// Rests A's sell of 0.5 btc as order 1, then restarts the market on the
/// same backends with `status`.
async fn reopened_with_resting_sell(status: &str) -> Harness {
    let publisher = Arc::new(MemoryPublisher::new());
    let backends = Backends {
        sequences: Arc::new(MemorySequenceStore::new()),
        publisher: publisher.clone(),
        orders: Arc::new(MemoryOrderStore::new()),
        ledger: Arc::new(MemoryLedger::new()),
    };
    let h = launch(exchange("0", "0"), backends.clone(), publisher.clone()).await;
    h.deposit(A, "btc", dec!(1));
    h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(0.5))).await.unwrap();
    h.settle().await;
    h.core.shutdown().await.unwrap();
    launch(market_exchange("0", "0", status), backends, publisher).await
}

async fn harness(maker: &str, taker: &str) -> Harness {
    start(exchange(maker, taker), MemorySequenceStore::new(), Arc::new(MemoryPublisher::new())).await
}

impl Harness {
    fn deposit(&self, user: u64, coin: &str, amount: Decimal) {
        let queue = self.core.queue();
        for op in [
            FundsOperation::NewDeposit {
                user_id: user,
                sub_account_id: 0,
                coin: coin.into(),
                amount,
            },
            FundsOperation::ConfirmDeposit {
                user_id: user,
                sub_account_id: 0,
                coin: coin.into(),
                amount,
            },
        ] {
            queue.apply_funds(&op).unwrap();
        }
    }

    async fn submit(&self, order: Order) -> Result<u64, QueueError> {
        self.core.queue().submit(order).await
    }

    async fn settle(&self) -> u64 {
        self.core.queue().market("btcusdt").unwrap().flush().await.unwrap()
    }

    fn balance(&self, user: u64, coin: &str) -> Balance {
        self.core.funds().balance(user, 0, coin).unwrap()
    }

    /// Every coin row of the user, as `(btc, usdt)`.
    fn balances(&self, user: u64) -> (Balance, Balance) {
        let rows = self.core.funds().get_balances(user, 0).unwrap();
        let row = |coin: &str| rows.get(coin).copied().unwrap_or_default();
        (row("btc"), row("usdt"))
    }

    async fn events(&self) -> Vec<Event> {
        self.publisher.read_since("btcusdt", 0).await.unwrap()
    }
}

fn limit(id: u64, owner: u64, side: Side, price: Decimal, amount: Decimal) -> Order {
    let mut o = Order::new(id, "btcusdt", side, OrderType::Limit, price, amount);
    o.owner_id = owner;
    o
}

/// OCO sell resting at `price` with a market stop leg `leg` at `stop_price`.
fn oco_sell(id: u64, leg: u64, owner: u64, price: Decimal, stop_price: Decimal, amount: Decimal) -> Order {
    let mut o = Order::new(id, "btcusdt", Side::Sell, OrderType::Oco, price, amount);
    o.owner_id = owner;
    o.stop_price = stop_price;
    o.sl_order_id = leg;
    o
}

fn bal(available: Decimal, locked: Decimal, in_orders: Decimal) -> Balance {
    Balance::new(available, locked, in_orders)
}

#[tokio::test]
async fn simple_match_settles_both_accounts() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));
    h.deposit(B, "usdt", dec!(50000));

    h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(0.5))).await.unwrap();
    let before = h.settle().await;
    h.submit(limit(2, B, Side::Buy, dec!(20000), dec!(0.5))).await.unwrap();
    let after = h.settle().await;

    assert_eq!(after - before, 3);
    let trades: Vec<_> = h.events().await.into_iter().filter_map(|e| e.trade().cloned()).collect();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].trade.volume, dec!(0.5));
    assert_eq!(trades[0].trade.quote_volume, dec!(10000));
    assert_eq!(trades[0].trade.taker_side, Side::Buy);

    assert_eq!(h.balance(A, "btc"), Balance::new(dec!(0.5), dec!(0), dec!(0)));
    assert_eq!(h.balance(A, "usdt").available, dec!(10000));
    assert_eq!(h.balance(B, "usdt"), Balance::new(dec!(40000), dec!(0), dec!(0)));
    assert_eq!(h.balance(B, "btc").available, dec!(0.5));
    assert_eq!(h.core.queue().market("btcusdt").unwrap().sequences(), (after, 1));
}

#[tokio::test]
async fn partial_fill_then_cancel_returns_the_rest() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));
    h.deposit(B, "usdt", dec!(50000));

    h.submit(limit(1, A, Side::Sell, dec!(21000), dec!(1))).await.unwrap();
    h.submit(limit(2, B, Side::Buy, dec!(21000), dec!(0.3))).await.unwrap();
    h.settle().await;
    assert_eq!(h.balance(A, "btc"), Balance::new(dec!(0), dec!(0.7), dec!(0.7)));

    let outcome = h.core.queue().cancel("btcusdt", 1, A).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Ok);
    assert_eq!(h.balance(A, "btc"), Balance::new(dec!(0.7), dec!(0), dec!(0)));
    assert_eq!(h.balance(A, "usdt").available, dec!(6300));

    let again = h.core.queue().cancel("btcusdt", 1, A).await.unwrap();
    assert_eq!(again, CancelOutcome::CancelFailedFromMe);
}

#[tokio::test]
async fn market_buy_locks_headroom_and_returns_the_residual() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));
    h.deposit(B, "usdt", dec!(50000));
    h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(1))).await.unwrap();
    h.settle().await;

    let mut buy = Order::new(2, "btcusdt", Side::Buy, OrderType::Market, dec!(0), dec!(0.1));
    buy.owner_id = B;
    buy.funds = dec!(3000);
    h.submit(buy).await.unwrap();
    h.settle().await;

    let filled = h
        .events()
        .await
        .into_iter()
        .filter_map(|e| e.order().filter(|o| o.id == 2).cloned())
        .last()
        .unwrap();
    assert_eq!(filled.locked_funds, dec!(2200));
    assert_eq!(filled.used_funds, dec!(2000));
    assert_eq!(h.balance(B, "usdt"), Balance::new(dec!(48000), dec!(0), dec!(0)));
    assert_eq!(h.balance(B, "btc").available, dec!(0.1));
}

#[tokio::test]
async fn second_concurrent_cancel_is_rejected() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));
    h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(1))).await.unwrap();
    h.settle().await;

    let queue = h.core.queue();
    let (first, second) = tokio::join!(queue.cancel("btcusdt", 1, A), queue.cancel("btcusdt", 1, A));
    assert_eq!(first.unwrap(), CancelOutcome::Ok);
    let err = second.unwrap_err();
    assert!(matches!(err, QueueError::Cancel(CancelError::AlreadyInProgress(1))));
    assert_eq!(err.code(), ErrorCode::CancelAlreadyInProgress);
    assert_eq!(h.balance(A, "btc"), Balance::new(dec!(1), dec!(0), dec!(0)));
}

#[tokio::test]
async fn self_trade_costs_only_the_fees() {
    let h = harness("0.001", "0.002").await;
    h.deposit(A, "btc", dec!(1));
    h.deposit(A, "usdt", dec!(50000));

    h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(0.5))).await.unwrap();
    h.submit(limit(2, A, Side::Buy, dec!(20000), dec!(0.5))).await.unwrap();
    h.settle().await;

    let trade = h.events().await.into_iter().find_map(|e| e.trade().cloned()).unwrap().trade;
    assert!(trade.self_trade);
    // maker ask pays 10 usdt, taker bid 0.001 btc
    assert_eq!(h.balance(A, "btc"), Balance::new(dec!(0.999), dec!(0), dec!(0)));
    assert_eq!(h.balance(A, "usdt"), Balance::new(dec!(49990), dec!(0), dec!(0)));
    assert_eq!(h.balance(REVENUE, "usdt").available, dec!(10));
    assert_eq!(h.balance(REVENUE, "btc").available, dec!(0.001));
}

#[tokio::test]
async fn rejected_orders_leave_balances_alone() {
    let h = harness("0", "0").await;
    h.deposit(B, "usdt", dec!(100));

    let err = h.submit(limit(1, B, Side::Buy, dec!(20000), dec!(0.5))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientFunds);

    let err = h.submit(limit(2, B, Side::Buy, dec!(20000), dec!(0))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOrder);

    let mut elsewhere = limit(3, B, Side::Buy, dec!(1), dec!(1));
    elsewhere.market_id = "ethusdt".into();
    assert!(matches!(h.submit(elsewhere).await, Err(QueueError::UnknownMarket(_))));

    assert_eq!(h.balance(B, "usdt"), Balance::new(dec!(100), dec!(0), dec!(0)));
    assert!(h.events().await.is_empty());
}

#[tokio::test]
async fn restart_resumes_after_the_logged_sequence() {
    // the saver last wrote 490, the log got as far as 500
    let sequences = MemorySequenceStore::new();
    sequences.put(event_key("btcusdt"), "490");
    sequences.put(trade_key("btcusdt"), "0");
    let publisher = Arc::new(MemoryPublisher::new());
    let logged = Event {
        seq_id: 500,
        created_at: 0,
        market_id: "btcusdt".into(),
        body: EventBody::Error(ErrorEvent {
            code: ErrorCode::CancelFailed,
            order_id: 42,
            owner_id: A,
            message: String::new(),
        }),
    };
    publisher.publish("btcusdt", &[logged]).await.unwrap();

    let h = start(exchange("0", "0"), sequences, publisher).await;
    assert_eq!(h.core.queue().market("btcusdt").unwrap().sequences(), (500, 0));

    h.deposit(A, "btc", dec!(1));
    h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(1))).await.unwrap();
    assert_eq!(h.settle().await, 501);
    let tail = h.publisher.read_since("btcusdt", 500).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].seq_id, 501);
}

#[tokio::test]
async fn shutdown_checkpoints_the_ledger() {
    let ledger = Arc::new(MemoryLedger::new());
    let backends = Backends {
        sequences: Arc::new(MemorySequenceStore::new()),
        publisher: Arc::new(MemoryPublisher::new()),
        orders: Arc::new(MemoryOrderStore::new()),
        ledger: ledger.clone(),
    };
    let core = TradingCore::start_with(&config(), exchange("0", "0"), backends).await.unwrap();
    let queue = core.queue();
    queue
        .apply_funds(&FundsOperation::NewDeposit {
            user_id: A,
            sub_account_id: 0,
            coin: "btc".into(),
            amount: dec!(2),
        })
        .unwrap();
    queue.submit(limit(1, A, Side::Sell, dec!(20000), dec!(1))).await.unwrap_err();
    drop(queue);
    core.shutdown().await.unwrap();

    let saved = ledger.last().unwrap();
    let row = saved.rows.iter().find(|r| r.user_id == A && r.coin == "btc").unwrap();
    // still pending confirmation, so nothing could be locked for the order
    assert_eq!(row.balance, Balance::new(dec!(0), dec!(2), dec!(0)));
}

#[tokio::test]
async fn duplicate_open_id_is_refused_without_touching_the_first() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));

    h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(0.5))).await.unwrap();
    h.settle().await;
    let err = h.submit(limit(1, A, Side::Sell, dec!(20000), dec!(0.3))).await.unwrap_err();
    assert!(matches!(err, QueueError::Order(OrderError::DuplicateId(1))));
    assert_eq!(err.code(), ErrorCode::InvalidOrder);
    h.settle().await;
    assert_eq!(h.balance(A, "btc"), bal(dec!(0.5), dec!(0.5), dec!(0.5)));

    assert_eq!(h.core.queue().cancel("btcusdt", 1, A).await.unwrap(), CancelOutcome::Ok);
    assert_eq!(h.balance(A, "btc"), bal(dec!(1), dec!(0), dec!(0)));
}

#[tokio::test]
async fn engine_refusal_of_a_clashing_leg_id_hands_the_lock_back() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));

    h.submit(oco_sell(1, 2, A, dec!(21000), dec!(19500), dec!(0.5))).await.unwrap();
    // id 2 is the parked stop leg, which has no order row of its own
    h.submit(limit(2, A, Side::Sell, dec!(20000), dec!(0.3))).await.unwrap();
    h.settle().await;

    let refused = h.events().await.into_iter().find_map(|e| e.error().cloned()).unwrap();
    assert_eq!((refused.order_id, refused.code), (2, ErrorCode::InvalidOrder));
    assert_eq!(h.balance(A, "btc"), bal(dec!(0.5), dec!(0.5), dec!(0.5)));

    assert_eq!(h.core.queue().cancel("btcusdt", 1, A).await.unwrap(), CancelOutcome::Ok);
    assert_eq!(h.balance(A, "btc"), bal(dec!(1), dec!(0), dec!(0)));
}

#[tokio::test]
async fn out_of_range_values_are_refused_not_fatal() {
    let h = harness("0", "0").await;
    h.deposit(B, "usdt", dec!(100));

    let err = h.submit(limit(1, B, Side::Buy, Decimal::MAX, dec!(2))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidAmount);
    let err = h.submit(limit(2, B, Side::Buy, MAX_MAGNITUDE, dec!(2))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientFunds);
    assert_eq!(h.balance(B, "usdt"), bal(dec!(100), dec!(0), dec!(0)));

    let queue = h.core.queue();
    let huge = FundsOperation::NewDeposit {
        user_id: A,
        sub_account_id: 0,
        coin: "btc".into(),
        amount: Decimal::MAX,
    };
    queue.apply_funds(&huge).unwrap();
    let err = queue.apply_funds(&huge).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidAmount);
    assert_eq!(h.balance(A, "btc"), bal(dec!(0), Decimal::MAX, dec!(0)));

    // the market is still serving
    h.submit(limit(3, B, Side::Buy, dec!(20000), dec!(0.005))).await.unwrap();
    h.settle().await;
    assert_eq!(h.balance(B, "usdt"), bal(dec!(0), dec!(100), dec!(100)));
    assert!(h.events().await.iter().all(|e| e.error().is_none()));
}

#[tokio::test]
async fn inactive_market_takes_cancels_only() {
    let h = reopened_with_resting_sell("inactive").await;
    assert_eq!(h.balance(A, "btc"), bal(dec!(0.5), dec!(0.5), dec!(0.5)));
    let logged = h.events().await.len();

    let err = h.submit(limit(2, A, Side::Sell, dec!(20000), dec!(0.1))).await.unwrap_err();
    assert!(matches!(err, QueueError::MarketInactive(_)));
    assert_eq!(err.code(), ErrorCode::MarketInactive);
    assert_eq!(h.balance(A, "btc"), bal(dec!(0.5), dec!(0.5), dec!(0.5)));
    assert_eq!(h.events().await.len(), logged);

    assert_eq!(h.core.queue().cancel("btcusdt", 1, A).await.unwrap(), CancelOutcome::Ok);
    assert_eq!(h.balance(A, "btc"), bal(dec!(1), dec!(0), dec!(0)));
}

#[tokio::test]
async fn disabled_market_refuses_orders_and_cancels() {
    let h = reopened_with_resting_sell("disabled").await;
    let logged = h.events().await.len();

    let err = h.submit(limit(2, A, Side::Sell, dec!(20000), dec!(0.1))).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MarketInactive);
    let err = h.core.queue().cancel("btcusdt", 1, A).await.unwrap_err();
    assert!(matches!(err, QueueError::MarketInactive(_)));
    assert_eq!(err.code(), ErrorCode::MarketInactive);

    assert_eq!(h.balance(A, "btc"), bal(dec!(0.5), dec!(0.5), dec!(0.5)));
    assert_eq!(h.events().await.len(), logged);
}

#[tokio::test]
async fn oco_stop_leg_fires_with_the_parent_lock() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));
    h.deposit(B, "usdt", dec!(19000));
    h.deposit(C, "btc", dec!(0.1));

    h.submit(oco_sell(1, 2, A, dec!(21000), dec!(19500), dec!(1))).await.unwrap();
    h.submit(limit(10, B, Side::Buy, dec!(19000), dec!(1))).await.unwrap();
    h.settle().await;
    assert_eq!(h.balance(A, "btc"), bal(dec!(0), dec!(1), dec!(1)));

    // trading at 19000 trips the 19500 stop; the market leg sells into B's bid
    h.submit(limit(11, C, Side::Sell, dec!(19000), dec!(0.1))).await.unwrap();
    h.settle().await;

    let leg = h
        .events()
        .await
        .into_iter()
        .filter_map(|e| e.order().filter(|o| o.id == 2).cloned())
        .last()
        .unwrap();
    assert_eq!((leg.filled_amount, leg.status), (dec!(0.9), OrderStatus::Cancelled));
    assert_eq!(h.balances(A), (bal(dec!(0.1), dec!(0), dec!(0)), bal(dec!(17100), dec!(0), dec!(0))));
    assert_eq!(h.balances(B), (bal(dec!(1), dec!(0), dec!(0)), bal(dec!(0), dec!(0), dec!(0))));
    assert_eq!(h.balances(C), (bal(dec!(0), dec!(0), dec!(0)), bal(dec!(1900), dec!(0), dec!(0))));
    assert_eq!(h.core.queue().cancel("btcusdt", 1, A).await.unwrap(), CancelOutcome::CancelFailedFromMe);
}

#[tokio::test]
async fn oco_parent_fill_retires_the_stop_leg() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));
    h.deposit(B, "usdt", dec!(21000));

    h.submit(oco_sell(1, 2, A, dec!(21000), dec!(19500), dec!(1))).await.unwrap();
    h.submit(limit(10, B, Side::Buy, dec!(21000), dec!(1))).await.unwrap();
    h.settle().await;

    let retired = h
        .events()
        .await
        .into_iter()
        .filter_map(|e| e.order().filter(|o| o.id == 2).cloned())
        .last()
        .unwrap();
    assert_eq!(retired.status, OrderStatus::Cancelled);
    assert_eq!(h.balances(A), (bal(dec!(0), dec!(0), dec!(0)), bal(dec!(21000), dec!(0), dec!(0))));
    assert_eq!(h.balances(B), (bal(dec!(1), dec!(0), dec!(0)), bal(dec!(0), dec!(0), dec!(0))));
    assert_eq!(h.core.queue().cancel("btcusdt", 2, A).await.unwrap(), CancelOutcome::CancelFailedFromMe);
}

#[tokio::test]
async fn strangle_buy_leg_fires_and_the_sell_leg_lock_comes_back() {
    let h = harness("0", "0").await;
    h.deposit(A, "btc", dec!(1));
    h.deposit(A, "usdt", dec!(20000));
    h.deposit(B, "usdt", dec!(21000));
    h.deposit(C, "btc", dec!(2));

    let mut strangle = Order::new(1, "btcusdt", Side::Buy, OrderType::Strangle, dec!(0), dec!(0.5));
    strangle.owner_id = A;
    strangle.tp_order_id = 2;
    strangle.sl_order_id = 3;
    strangle.tp_price = dec!(21000);
    strangle.sl_price = dec!(19000);
    h.submit(strangle).await.unwrap();
    h.settle().await;
    assert_eq!(
        h.balances(A),
        (bal(dec!(0.5), dec!(0.5), dec!(0.5)), bal(dec!(9500), dec!(10500), dec!(10500)))
    );

    h.submit(limit(10, C, Side::Sell, dec!(21000), dec!(1))).await.unwrap();
    h.submit(limit(11, B, Side::Buy, dec!(21000), dec!(0.1))).await.unwrap();
    h.settle().await;

    let events = h.events().await;
    let last_of = |id: u64| events.iter().filter_map(|e| e.order().filter(|o| o.id == id)).last().cloned();
    assert_eq!(last_of(3).map(|o| o.status), Some(OrderStatus::Cancelled));
    assert_eq!(last_of(2).map(|o| o.status), Some(OrderStatus::Filled));
    assert_eq!(h.balances(A), (bal(dec!(1.5), dec!(0), dec!(0)), bal(dec!(9500), dec!(0), dec!(0))));
    assert_eq!(h.balances(B), (bal(dec!(0.1), dec!(0), dec!(0)), bal(dec!(18900), dec!(0), dec!(0))));
    assert_eq!(h.balances(C), (bal(dec!(1), dec!(0.4), dec!(0.4)), bal(dec!(12600), dec!(0), dec!(0))));
    assert_eq!(h.core.queue().cancel("btcusdt", 1, A).await.unwrap(), CancelOutcome::CancelFailedFromMe);
}
