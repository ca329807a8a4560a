//! Sequence counters shared between a market engine and its saver, and the
//! stores they are checkpointed to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_core::{Event, EventBody};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{shutdown_requested, ShutdownRx};

/// Last published event and trade sequence of one market.
///
/// Written by the market's event task after each publication, read by the
/// saver on its tick. Each counter is atomic on its own; the pair is not.
#[derive(Debug, Default)]
pub struct SequenceState {
    event_seq: AtomicU64,
    trade_seq: AtomicU64,
}

impl SequenceState {
    pub fn new(event_seq: u64, trade_seq: u64) -> Self {
        SequenceState {
            event_seq: AtomicU64::new(event_seq),
            trade_seq: AtomicU64::new(trade_seq),
        }
    }

    pub fn event_seq(&self) -> u64 {
        self.event_seq.load(Ordering::Acquire)
    }

    pub fn trade_seq(&self) -> u64 {
        self.trade_seq.load(Ordering::Acquire)
    }

    pub fn load_pair(&self) -> (u64, u64) {
        (self.event_seq(), self.trade_seq())
    }

    /// Move both counters past a published batch. Never goes backwards.
    pub fn advance(&self, events: &[Event]) {
        for event in events {
            self.event_seq.fetch_max(event.seq_id, Ordering::AcqRel);
            if let EventBody::NewTrade(t) = &event.body {
                self.trade_seq.fetch_max(t.trade.seq_id, Ordering::AcqRel);
            }
        }
    }
}

pub fn event_key(market_id: &str) -> String {
    format!("seqid__{market_id}__event")
}

pub fn trade_key(market_id: &str) -> String {
    format!("seqid__{market_id}__trade")
}

/// Where sequence checkpoints live.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Fails when either counter is missing or unparseable.
    async fn load(&self, market_id: &str) -> Result<(u64, u64), StoreError>;

    async fn save(&self, market_id: &str, event_seq: u64, trade_seq: u64) -> Result<(), StoreError>;
}

/// Process-local store, for tests and single-node runs without Redis.
#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw write, used to seed or corrupt state in tests.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.lock().insert(key.into(), value.into());
    }
}

fn parse_counter(key: String, raw: Option<String>) -> Result<u64, StoreError> {
    let value = raw.ok_or_else(|| StoreError::Missing { key: key.clone() })?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| StoreError::Unparseable { key, value })
}

#[async_trait]
impl SequenceStore for MemorySequenceStore {
    async fn load(&self, market_id: &str) -> Result<(u64, u64), StoreError> {
        let values = self.values.lock();
        let (ek, tk) = (event_key(market_id), trade_key(market_id));
        let event = values.get(&ek).cloned();
        let trade = values.get(&tk).cloned();
        drop(values);
        Ok((parse_counter(ek, event)?, parse_counter(tk, trade)?))
    }

    async fn save(&self, market_id: &str, event_seq: u64, trade_seq: u64) -> Result<(), StoreError> {
        let mut values = self.values.lock();
        values.insert(event_key(market_id), event_seq.to_string());
        values.insert(trade_key(market_id), trade_seq.to_string());
        Ok(())
    }
}

/// Both counters as decimal strings under `seqid__<market>__event` and
/// `seqid__<market>__trade`.
#[derive(Clone)]
pub struct RedisSequenceStore {
    conn: MultiplexedConnection,
}

impl RedisSequenceStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        RedisSequenceStore { conn }
    }
}

#[async_trait]
impl SequenceStore for RedisSequenceStore {
    async fn load(&self, market_id: &str) -> Result<(u64, u64), StoreError> {
        let mut conn = self.conn.clone();
        let (ek, tk) = (event_key(market_id), trade_key(market_id));
        let (event, trade): (Option<String>, Option<String>) = redis::pipe()
            .get(&ek)
            .get(&tk)
            .query_async(&mut conn)
            .await?;
        Ok((parse_counter(ek, event)?, parse_counter(tk, trade)?))
    }

    async fn save(&self, market_id: &str, event_seq: u64, trade_seq: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(event_key(market_id), event_seq.to_string()).await?;
        conn.set::<_, _, ()>(trade_key(market_id), trade_seq.to_string()).await?;
        Ok(())
    }
}

/// Periodic checkpoint of one market's [`SequenceState`].
pub struct SequenceSaver {
    market_id: String,
    state: Arc<SequenceState>,
    store: Arc<dyn SequenceStore>,
    interval: Duration,
}

impl SequenceSaver {
    pub fn new(
        market_id: impl Into<String>,
        state: Arc<SequenceState>,
        store: Arc<dyn SequenceStore>,
        interval: Duration,
    ) -> Self {
        SequenceSaver {
            market_id: market_id.into(),
            state,
            store,
            interval,
        }
    }

    /// Save on every tick until `stop` fires, then save once more.
    pub fn spawn(self, mut stop: ShutdownRx) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_saved = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pair = self.state.load_pair();
                        if last_saved != Some(pair) && self.save(pair).await {
                            last_saved = Some(pair);
                        }
                    }
                    _ = shutdown_requested(&mut stop) => break,
                }
            }
            let pair = self.state.load_pair();
            if self.save(pair).await {
                info!(market = %self.market_id, event_seq = pair.0, trade_seq = pair.1, "final sequence save");
            }
        })
    }

    async fn save(&self, (event_seq, trade_seq): (u64, u64)) -> bool {
        match self.store.save(&self.market_id, event_seq, trade_seq).await {
            Ok(()) => {
                debug!(market = %self.market_id, event_seq, trade_seq, "sequence saved");
                true
            }
            Err(err) => {
                warn!(market = %self.market_id, error = %err, "sequence save failed, retrying next tick");
                false
            }
        }
    }
}
