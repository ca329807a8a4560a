//! Per-market persistent log of open orders.
//!
//! Orders are appended at admission and then follow the published event
//! stream: every snapshot is upserted, terminal ones are dropped. On startup
//! the surviving rows seed the matching engine.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use engine_core::{Event, Order};
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::StoreError;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Store a freshly admitted order unless a row with its id is still
    /// open. Returns whether it was stored.
    async fn append(&self, order: &Order) -> Result<bool, StoreError>;

    /// Drop an order that was appended but never reached the engine.
    async fn remove(&self, market_id: &str, order_id: u64) -> Result<(), StoreError>;

    /// Fold a published batch into the stored rows.
    async fn apply(&self, market_id: &str, events: &[Event]) -> Result<(), StoreError>;

    /// Open orders of one market, oldest first.
    async fn open_orders(&self, market_id: &str) -> Result<Vec<Order>, StoreError>;
}

/// Latest snapshot per order id touched by `events`.
fn latest_snapshots(events: &[Event]) -> BTreeMap<u64, &Order> {
    let mut latest = BTreeMap::new();
    for event in events {
        for order in event.order_snapshots() {
            latest.insert(order.id, order);
        }
    }
    latest
}

fn by_admission(mut orders: Vec<Order>) -> Vec<Order> {
    orders.sort_by_key(|o| (o.created_at, o.id));
    orders
}

#[derive(Default)]
pub struct MemoryOrderStore {
    markets: RwLock<HashMap<String, BTreeMap<u64, Order>>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn append(&self, order: &Order) -> Result<bool, StoreError> {
        let mut markets = self.markets.write();
        let rows = markets.entry(order.market_id.clone()).or_default();
        if rows.contains_key(&order.id) {
            return Ok(false);
        }
        rows.insert(order.id, order.clone());
        Ok(true)
    }

    async fn remove(&self, market_id: &str, order_id: u64) -> Result<(), StoreError> {
        if let Some(rows) = self.markets.write().get_mut(market_id) {
            rows.remove(&order_id);
        }
        Ok(())
    }

    async fn apply(&self, market_id: &str, events: &[Event]) -> Result<(), StoreError> {
        let latest = latest_snapshots(events);
        let mut markets = self.markets.write();
        let rows = markets.entry(market_id.to_string()).or_default();
        for (id, order) in latest {
            if order.status.is_terminal() {
                rows.remove(&id);
            } else {
                rows.insert(id, order.clone());
            }
        }
        Ok(())
    }

    async fn open_orders(&self, market_id: &str) -> Result<Vec<Order>, StoreError> {
        let markets = self.markets.read();
        let orders = markets
            .get(market_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(by_admission(orders))
    }
}

/// `HSET orders__<market> <order_id> <json>`.
#[derive(Clone)]
pub struct RedisOrderStore {
    conn: MultiplexedConnection,
}

pub fn orders_key(market_id: &str) -> String {
    format!("orders__{market_id}")
}

impl RedisOrderStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        RedisOrderStore { conn }
    }
}

#[async_trait]
impl OrderStore for RedisOrderStore {
    async fn append(&self, order: &Order) -> Result<bool, StoreError> {
        let json = serde_json::to_string(order)?;
        let mut conn = self.conn.clone();
        let stored: bool = conn.hset_nx(orders_key(&order.market_id), order.id, json).await?;
        Ok(stored)
    }

    async fn remove(&self, market_id: &str, order_id: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(orders_key(market_id), order_id).await?;
        Ok(())
    }

    async fn apply(&self, market_id: &str, events: &[Event]) -> Result<(), StoreError> {
        let latest = latest_snapshots(events);
        if latest.is_empty() {
            return Ok(());
        }
        let key = orders_key(market_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (id, order) in latest {
            if order.status.is_terminal() {
                pipe.hdel(&key, id).ignore();
            } else {
                pipe.hset(&key, id, serde_json::to_string(order)?).ignore();
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn open_orders(&self, market_id: &str) -> Result<Vec<Order>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: HashMap<String, String> = conn.hgetall(orders_key(market_id)).await?;
        let orders = rows
            .values()
            .map(|json| serde_json::from_str::<Order>(json))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(by_admission(orders))
    }
}
