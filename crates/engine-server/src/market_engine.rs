//! One market's runtime: the order task that owns the matching engine and
//! the event task that publishes and settles what it produces.
//!
//! ```text
//! MarketHandle::process ──► orders (bounded) ──► order task ──► events (bounded)
//!                                                                  │
//!   publish ─► advance SequenceState ─► settle ─► cancel registry ─► order store
//! ```
//!
//! Nothing outside the order task touches the matching engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use engine_core::{CommandType, Decimal, Event, Market, MatchingEngine, Order, OrderCommand};
use engine_funds::{AccountKey, FundsEngine};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel_registry::CancelConfirmationRegistry;
use crate::error::{QueueError, StartupError};
use crate::fanout::EventFanout;
use crate::ledger::Checkpointer;
use crate::order_queue::release_reserved;
use crate::order_store::OrderStore;
use crate::publisher::EventPublisher;
use crate::sequence::{SequenceSaver, SequenceState, SequenceStore};
use crate::types::{shutdown_channel, shutdown_requested, EventBatch, ShutdownRx};

/// Exit code of a process halted by a ledger invariant violation.
pub const FATAL_EXIT_CODE: i32 = 70;

const RETRY_START: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(2);
/// Attempts left to an operation once shutdown has started.
const SHUTDOWN_ATTEMPTS: u32 = 3;

/// Shared collaborators of every market engine.
#[derive(Clone)]
pub struct MarketDeps {
    pub funds: Arc<FundsEngine>,
    pub checkpointer: Arc<Checkpointer>,
    pub publisher: Arc<dyn EventPublisher>,
    pub sequences: Arc<dyn SequenceStore>,
    pub orders: Arc<dyn OrderStore>,
    pub revenue: AccountKey,
}

#[derive(Debug, Clone, Copy)]
pub struct MarketSettings {
    pub orders_capacity: usize,
    pub events_capacity: usize,
    pub snapshot_interval: Duration,
}

enum Inbound {
    Command(OrderCommand),
    /// Answered with the event sequence reached once every earlier command
    /// was processed.
    Barrier(oneshot::Sender<u64>),
}

/// Cheap, cloneable front of one running market engine.
#[derive(Clone)]
pub struct MarketHandle {
    market: Arc<Market>,
    orders: mpsc::Sender<Inbound>,
    processed: watch::Receiver<u64>,
    last_price: watch::Receiver<Option<Decimal>>,
    state: Arc<SequenceState>,
    registry: CancelConfirmationRegistry,
}

impl MarketHandle {
    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn registry(&self) -> &CancelConfirmationRegistry {
        &self.registry
    }

    pub fn sequences(&self) -> (u64, u64) {
        self.state.load_pair()
    }

    /// Price of the newest settled trade.
    pub fn last_price(&self) -> Option<Decimal> {
        *self.last_price.borrow()
    }

    /// Highest event sequence whose settlement completed.
    pub fn processed(&self) -> u64 {
        *self.processed.borrow()
    }

    /// Enqueue a command. Waits only while the orders channel is full.
    pub async fn process(&self, cmd: OrderCommand) -> Result<(), QueueError> {
        self.orders
            .send(Inbound::Command(cmd))
            .await
            .map_err(|_| QueueError::EngineStopped(self.market.id.clone()))
    }

    /// Resolves once `seq` has been published, settled and stored.
    pub async fn wait_processed(&self, seq: u64) -> Result<(), QueueError> {
        let mut rx = self.processed.clone();
        rx.wait_for(|done| *done >= seq)
            .await
            .map(|_| ())
            .map_err(|_| QueueError::EngineStopped(self.market.id.clone()))
    }

    /// Resolves once everything enqueued before the call went through the
    /// whole pipeline. Returns the event sequence reached.
    pub async fn flush(&self) -> Result<u64, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.orders
            .send(Inbound::Barrier(tx))
            .await
            .map_err(|_| QueueError::EngineStopped(self.market.id.clone()))?;
        let seq = rx.await.map_err(|_| QueueError::EngineStopped(self.market.id.clone()))?;
        self.wait_processed(seq).await?;
        Ok(seq)
    }
}

pub struct MarketEngine;

impl MarketEngine {
    /// Recover the market's state and spawn its tasks.
    ///
    /// Recovery: stored sequences (zero when unreadable) seed the engine
    /// with the stored open orders, the published tail is replayed on top,
    /// and the counters end at no less than what the publisher last saw.
    /// Events after the ledger's settled mark are settled again.
    ///
    /// The returned task ends after `shutdown` fires and both channels
    /// drained, once the saver made its final save.
    pub async fn start(
        market: Market,
        deps: MarketDeps,
        registry: CancelConfirmationRegistry,
        settings: MarketSettings,
        shutdown: ShutdownRx,
    ) -> Result<(MarketHandle, JoinHandle<()>), StartupError> {
        let id = market.id.clone();
        let fanout = EventFanout::new(market.clone(), deps.funds.clone(), deps.revenue);

        let stored = match deps.sequences.load(&id).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(market = %id, error = %err, "no stored sequences, recovering from the event log");
                (0, 0)
            }
        };
        let published = deps.publisher.last_sequence(&id).await?.unwrap_or((0, 0));
        let open = deps.orders.open_orders(&id).await?;
        let settled_mark = deps.checkpointer.settled(&id);

        let mut engine = MatchingEngine::new(market.clone());
        engine.load(open, stored.0, stored.1);

        let from = settled_mark.map_or(stored.0, |mark| mark.min(stored.0));
        let tail = deps.publisher.read_since(&id, from).await?;
        engine.replay(&tail);

        let target = (engine.event_seq().max(published.0), engine.trade_seq().max(published.1));
        if target != (engine.event_seq(), engine.trade_seq()) {
            warn!(
                market = %id,
                engine = ?(engine.event_seq(), engine.trade_seq()),
                published = ?published,
                "publisher is ahead of the recovered stream, skipping sequences"
            );
            let open = engine.open_orders();
            engine.load(open, target.0, target.1);
        }

        if let Some(mark) = settled_mark {
            let unsettled: Vec<Event> = tail.iter().filter(|e| e.seq_id > mark).cloned().collect();
            if let Some(last) = unsettled.last().map(|e| e.seq_id) {
                info!(market = %id, from = mark, to = last, count = unsettled.len(), "re-settling events after checkpoint");
                deps.checkpointer
                    .settle(&id, last, || fanout.settle(&unsettled))
                    .map_err(|source| StartupError::Settlement {
                        market: id.clone(),
                        from: mark,
                        source,
                    })?;
            }
        }
        deps.orders.apply(&id, &tail).await?;

        let state = Arc::new(SequenceState::new(engine.event_seq(), engine.trade_seq()));
        let seq = engine.event_seq();
        info!(
            market = %id,
            event_seq = seq,
            trade_seq = engine.trade_seq(),
            open_orders = engine.open_orders().len(),
            replayed = tail.len(),
            "market engine recovered"
        );

        let (orders_tx, orders_rx) = mpsc::channel(settings.orders_capacity);
        let (events_tx, events_rx) = mpsc::channel(settings.events_capacity);
        let (processed_tx, processed_rx) = watch::channel(seq);
        let initial_price = Some(engine.last_price()).filter(|p| !p.is_zero());
        let (price_tx, price_rx) = watch::channel(initial_price);

        let refunds = Refunds {
            funds: deps.funds.clone(),
            orders: deps.orders.clone(),
        };
        let order_task = tokio::spawn(run_orders(engine, refunds, orders_rx, events_tx, shutdown.clone()));
        let event_task = tokio::spawn(
            EventTask {
                market_id: id.clone(),
                fanout,
                deps: deps.clone(),
                registry: registry.clone(),
                state: state.clone(),
                processed: processed_tx,
                last_price: price_tx,
                shutdown,
                gap_at: None,
            }
            .run(events_rx),
        );

        let (saver_stop, saver_rx) = shutdown_channel();
        let saver = SequenceSaver::new(id.clone(), state.clone(), deps.sequences.clone(), settings.snapshot_interval)
            .spawn(saver_rx);

        let market_id = id.clone();
        let supervisor = tokio::spawn(async move {
            if let Err(err) = order_task.await {
                error!(market = %market_id, error = %err, "order task panicked");
            }
            if let Err(err) = event_task.await {
                error!(market = %market_id, error = %err, "event task panicked");
            }
            let _ = saver_stop.send(true);
            if let Err(err) = saver.await {
                error!(market = %market_id, error = %err, "sequence saver panicked");
            }
            info!(market = %market_id, "market engine stopped");
        });

        let handle = MarketHandle {
            market: Arc::new(market),
            orders: orders_tx,
            processed: processed_rx,
            last_price: price_rx,
            state,
            registry,
        };
        Ok((handle, supervisor))
    }
}

/// Hands back what admission reserved for a new order the engine refused.
/// The queue stored such an order under an id no open row held, so its
/// row goes too.
struct Refunds {
    funds: Arc<FundsEngine>,
    orders: Arc<dyn OrderStore>,
}

impl Refunds {
    async fn refund(&self, market: &Market, order: &Order) {
        warn!(market = %market.id, order = order.id, "new order refused by the engine, releasing its lock");
        release_reserved(&self.funds, order, market);
        if let Err(err) = self.orders.remove(&market.id, order.id).await {
            warn!(market = %market.id, order = order.id, error = %err, "could not drop refused order from the store");
        }
    }
}

/// Whether `batch` is the engine refusing new order `id`.
fn refused(batch: &[Event], id: u64) -> bool {
    matches!(batch, [only] if only.error().map_or(false, |e| e.order_id == id))
}

async fn run_orders(
    mut engine: MatchingEngine,
    refunds: Refunds,
    mut orders: mpsc::Receiver<Inbound>,
    events: mpsc::Sender<EventBatch>,
    mut shutdown: ShutdownRx,
) {
    let market_id = engine.market().id.clone();
    loop {
        tokio::select! {
            biased;
            msg = orders.recv() => match msg {
                Some(msg) => {
                    if !handle(&mut engine, &refunds, msg, &events).await {
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown_requested(&mut shutdown) => {
                orders.close();
                let mut drained = 0usize;
                while let Some(msg) = orders.recv().await {
                    drained += 1;
                    if !handle(&mut engine, &refunds, msg, &events).await {
                        return;
                    }
                }
                info!(market = %market_id, drained, "orders drained");
                break;
            }
        }
    }
    debug!(market = %market_id, event_seq = engine.event_seq(), "order task stopped");
}

/// `false` once the event task is gone.
async fn handle(
    engine: &mut MatchingEngine,
    refunds: &Refunds,
    msg: Inbound,
    events: &mpsc::Sender<EventBatch>,
) -> bool {
    match msg {
        Inbound::Command(cmd) => {
            let admitted = (cmd.event_type == CommandType::NewOrder).then(|| cmd.order.clone());
            let batch = engine.process(cmd);
            if batch.is_empty() {
                return true;
            }
            if let Some(order) = admitted.filter(|o| refused(&batch, o.id)) {
                refunds.refund(engine.market(), &order).await;
            }
            if events.send(Arc::new(batch)).await.is_err() {
                error!(market = %engine.market().id, "event task gone, order task stopping");
                return false;
            }
            true
        }
        Inbound::Barrier(tx) => {
            let _ = tx.send(engine.event_seq());
            true
        }
    }
}

struct EventTask {
    market_id: String,
    fanout: EventFanout,
    deps: MarketDeps,
    registry: CancelConfirmationRegistry,
    state: Arc<SequenceState>,
    processed: watch::Sender<u64>,
    last_price: watch::Sender<Option<Decimal>>,
    shutdown: ShutdownRx,
    /// First event seq missing from the log. Nothing past it is published
    /// or counted as published.
    gap_at: Option<u64>,
}

impl EventTask {
    /// Ends when the order task dropped its sender and every batch went
    /// through.
    async fn run(mut self, mut events: mpsc::Receiver<EventBatch>) {
        while let Some(batch) = events.recv().await {
            self.on_batch(batch).await;
        }
        debug!(market = %self.market_id, "event task stopped");
    }

    async fn on_batch(&mut self, batch: EventBatch) {
        let Some(last) = batch.last().map(|e| e.seq_id) else {
            return;
        };
        let id = self.market_id.as_str();

        let published = match self.gap_at {
            None => {
                self.retry("publish", || self.deps.publisher.publish(id, &batch))
                    .await
            }
            Some(gap) => {
                debug!(market = %id, gap, last, "log has a gap, not publishing");
                false
            }
        };
        if published {
            self.state.advance(&batch);
        } else {
            error!(market = %id, first = batch[0].seq_id, last, "events dropped from the log");
            self.gap_at.get_or_insert(batch[0].seq_id);
        }

        let settled = self.deps.checkpointer.settle(id, last, || self.fanout.settle(&batch));
        if let Err(err) = settled {
            if err.is_fatal() {
                error!(market = %id, seq = last, error = %err, "ledger diverged from the engine, halting");
                std::process::exit(FATAL_EXIT_CODE);
            }
            error!(market = %id, seq = last, error = %err, "settlement skipped");
        }

        if let Err(err) = self.registry.dispatch(batch.clone()).await {
            warn!(market = %id, error = %err, "cancel waiters not notified");
        }

        self.retry("order store apply", || self.deps.orders.apply(id, &batch))
            .await;

        if let Some(price) = batch.iter().rev().find_map(|e| e.trade().map(|t| t.trade.price)) {
            self.last_price.send_replace(Some(price));
        }
        self.processed.send_replace(last);
    }

    /// Retries with capped exponential backoff until `op` succeeds. Once
    /// shutdown started only a few attempts remain. Returns whether it
    /// succeeded.
    async fn retry<F, Fut, E>(&self, what: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut delay = RETRY_START;
        let mut attempt = 0u32;
        let mut left_after_shutdown = SHUTDOWN_ATTEMPTS;
        loop {
            attempt += 1;
            match op().await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(market = %self.market_id, attempt, error = %err, "{what} failed");
                    if *self.shutdown.borrow() {
                        left_after_shutdown -= 1;
                        if left_after_shutdown == 0 {
                            error!(market = %self.market_id, attempt, "{what} abandoned during shutdown");
                            return false;
                        }
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
            }
        }
    }
}
