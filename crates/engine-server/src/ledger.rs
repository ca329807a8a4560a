//! Persistent balance checkpoints.
//!
//! The funds engine is warmed from the last checkpoint on startup. Each
//! checkpoint also records, per market, the last event sequence whose
//! settlement it contains, so startup can settle whatever was published
//! after it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use engine_funds::{BalanceRow, FundsEngine};
use parking_lot::{Mutex, RwLock};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;

/// One consistent cut of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub rows: Vec<BalanceRow>,
    /// `market_id -> event_seq` settled into `rows`.
    pub settled: BTreeMap<String, u64>,
}

#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// `None` when nothing was ever checkpointed.
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError>;

    async fn checkpoint(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryLedger {
    last: RwLock<Option<LedgerSnapshot>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(snapshot: LedgerSnapshot) -> Self {
        MemoryLedger {
            last: RwLock::new(Some(snapshot)),
        }
    }

    pub fn last(&self) -> Option<LedgerSnapshot> {
        self.last.read().clone()
    }
}

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        Ok(self.last())
    }

    async fn checkpoint(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        *self.last.write() = Some(snapshot.clone());
        Ok(())
    }
}

/// `balances` hash of `<user>:<sub_account>:<coin> -> json balance` plus a
/// `balances__settled` hash of `<market> -> event_seq`, replaced together.
#[derive(Clone)]
pub struct RedisLedger {
    conn: MultiplexedConnection,
}

const BALANCES_KEY: &str = "balances";
const SETTLED_KEY: &str = "balances__settled";

impl RedisLedger {
    pub fn new(conn: MultiplexedConnection) -> Self {
        RedisLedger { conn }
    }
}

fn row_field(row: &BalanceRow) -> String {
    format!("{}:{}:{}", row.user_id, row.sub_account_id, row.coin)
}

fn parse_row(field: &str, json: &str) -> Result<BalanceRow, StoreError> {
    let bad = || StoreError::Unparseable {
        key: format!("{BALANCES_KEY}/{field}"),
        value: json.to_string(),
    };
    let mut parts = field.splitn(3, ':');
    let user_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let sub_account_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let coin = parts.next().filter(|c| !c.is_empty()).ok_or_else(bad)?;
    Ok(BalanceRow {
        user_id,
        sub_account_id,
        coin: coin.to_string(),
        balance: serde_json::from_str(json)?,
    })
}

#[async_trait]
impl BalanceLedger for RedisLedger {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        let mut conn = self.conn.clone();
        let (rows, settled): (HashMap<String, String>, HashMap<String, String>) = redis::pipe()
            .hgetall(BALANCES_KEY)
            .hgetall(SETTLED_KEY)
            .query_async(&mut conn)
            .await?;
        if rows.is_empty() && settled.is_empty() {
            return Ok(None);
        }
        let mut snapshot = LedgerSnapshot::default();
        for (field, json) in &rows {
            snapshot.rows.push(parse_row(field, json)?);
        }
        snapshot
            .rows
            .sort_by(|a, b| (a.user_id, a.sub_account_id, &a.coin).cmp(&(b.user_id, b.sub_account_id, &b.coin)));
        for (market, seq) in settled {
            let parsed = seq.parse().map_err(|_| StoreError::Unparseable {
                key: format!("{SETTLED_KEY}/{market}"),
                value: seq.clone(),
            })?;
            snapshot.settled.insert(market, parsed);
        }
        Ok(Some(snapshot))
    }

    async fn checkpoint(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(BALANCES_KEY).ignore().del(SETTLED_KEY).ignore();
        for row in &snapshot.rows {
            pipe.hset(BALANCES_KEY, row_field(row), serde_json::to_string(&row.balance)?)
                .ignore();
        }
        for (market, seq) in &snapshot.settled {
            pipe.hset(SETTLED_KEY, market, seq.to_string()).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// Coordinates settlement with checkpoints.
///
/// Fanouts settle a batch while holding the gate shared and then record the
/// batch's last sequence; a checkpoint holds it exclusively while it copies
/// the balances and those sequences, so the two always agree.
pub struct Checkpointer {
    funds: Arc<FundsEngine>,
    ledger: Arc<dyn BalanceLedger>,
    gate: RwLock<()>,
    settled: Mutex<BTreeMap<String, u64>>,
}

impl Checkpointer {
    pub fn new(funds: Arc<FundsEngine>, ledger: Arc<dyn BalanceLedger>, settled: BTreeMap<String, u64>) -> Self {
        Checkpointer {
            funds,
            ledger,
            gate: RwLock::new(()),
            settled: Mutex::new(settled),
        }
    }

    /// Run a synchronous settlement of `market_id` up to `seq`.
    pub fn settle<R>(&self, market_id: &str, seq: u64, settle: impl FnOnce() -> R) -> R {
        let _gate = self.gate.read();
        let out = settle();
        let mut settled = self.settled.lock();
        let mark = settled.entry(market_id.to_string()).or_insert(0);
        *mark = (*mark).max(seq);
        out
    }

    pub fn settled(&self, market_id: &str) -> Option<u64> {
        self.settled.lock().get(market_id).copied()
    }

    /// Copy balances and sequences as of now.
    pub fn cut(&self) -> LedgerSnapshot {
        let _gate = self.gate.write();
        LedgerSnapshot {
            rows: self.funds.snapshot(),
            settled: self.settled.lock().clone(),
        }
    }

    pub async fn checkpoint(&self) -> Result<usize, StoreError> {
        let snapshot = self.cut();
        self.ledger.checkpoint(&snapshot).await?;
        Ok(snapshot.rows.len())
    }

    /// Checkpoint, logging instead of failing.
    pub async fn checkpoint_logged(&self, reason: &str) {
        match self.checkpoint().await {
            Ok(rows) => info!(rows, reason, "balance checkpoint written"),
            Err(err) => warn!(error = %err, reason, "balance checkpoint failed"),
        }
    }
}
