//! The external event log every market publishes to.
//!
//! Events travel in their binary wire form. The log doubles as the replay
//! source on startup: whatever was published after the last checkpoint is
//! read back and re-applied.

use std::collections::HashMap;

use async_trait::async_trait;
use engine_core::{Event, EventBody};
use engine_protocol::{decode_event, event_to_bytes};
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamRangeReply;
use redis::AsyncCommands;

use crate::error::PublishError;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Append a batch, in order. Returns only once the whole batch is durable.
    async fn publish(&self, market_id: &str, events: &[Event]) -> Result<(), PublishError>;

    /// Published events with `seq_id > after`, oldest first.
    async fn read_since(&self, market_id: &str, after: u64) -> Result<Vec<Event>, PublishError>;

    /// Newest published `(event_seq, trade_seq)`, if anything was published.
    async fn last_sequence(&self, market_id: &str) -> Result<Option<(u64, u64)>, PublishError>;
}

/// Walks back from the newest event to the newest trade.
fn sequence_of(events: &[Event]) -> Option<(u64, u64)> {
    let last = events.last()?;
    let trade_seq = events
        .iter()
        .rev()
        .find_map(|e| match &e.body {
            EventBody::NewTrade(t) => Some(t.trade.seq_id),
            _ => None,
        })
        .unwrap_or(0);
    Some((last.seq_id, trade_seq))
}

/// In-process log keeping the encoded bytes, so every publish still goes
/// through the wire codec.
#[derive(Default)]
pub struct MemoryPublisher {
    logs: RwLock<HashMap<String, Vec<bytes::Bytes>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, market_id: &str) -> usize {
        self.logs.read().get(market_id).map_or(0, Vec::len)
    }

    fn decoded(&self, market_id: &str) -> Result<Vec<Event>, PublishError> {
        let logs = self.logs.read();
        let Some(log) = logs.get(market_id) else {
            return Ok(Vec::new());
        };
        log.iter().map(|b| decode_event(b).map_err(PublishError::from)).collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, market_id: &str, events: &[Event]) -> Result<(), PublishError> {
        let encoded = events.iter().map(event_to_bytes).collect::<Result<Vec<_>, _>>()?;
        self.logs.write().entry(market_id.to_string()).or_default().extend(encoded);
        Ok(())
    }

    async fn read_since(&self, market_id: &str, after: u64) -> Result<Vec<Event>, PublishError> {
        let mut events = self.decoded(market_id)?;
        events.retain(|e| e.seq_id > after);
        Ok(events)
    }

    async fn last_sequence(&self, market_id: &str) -> Result<Option<(u64, u64)>, PublishError> {
        Ok(sequence_of(&self.decoded(market_id)?))
    }
}

/// One Redis stream per market, `events__<market>`, entry id `<seq>-1`,
/// payload field `event`. The explicit ids make a republished event after a
/// crash fail instead of duplicating.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: MultiplexedConnection,
}

const PAYLOAD_FIELD: &str = "event";
const READ_BATCH: usize = 1_000;

pub fn stream_key(market_id: &str) -> String {
    format!("events__{market_id}")
}

/// Stream entry id of the event with `seq`.
fn entry_id(seq: u64) -> String {
    format!("{seq}-1")
}

/// Inclusive lower bound for a forward read of everything after `seq`.
fn first_after(seq: u64) -> String {
    entry_id(seq + 1)
}

/// Inclusive upper bound for a backward read of everything before `seq`,
/// or `None` when nothing can precede it.
fn last_before(seq: u64) -> Option<String> {
    (seq > 1).then(|| entry_id(seq - 1))
}

impl RedisStreamPublisher {
    pub fn new(conn: MultiplexedConnection) -> Self {
        RedisStreamPublisher { conn }
    }

    fn decode_reply(reply: StreamRangeReply) -> Result<Vec<Event>, PublishError> {
        reply
            .ids
            .into_iter()
            .map(|entry| -> Result<Event, PublishError> {
                let raw: Vec<u8> = entry
                    .get(PAYLOAD_FIELD)
                    .ok_or_else(|| PublishError::MalformedEntry { id: entry.id.clone() })?;
                Ok(decode_event(&raw)?)
            })
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, market_id: &str, events: &[Event]) -> Result<(), PublishError> {
        if events.is_empty() {
            return Ok(());
        }
        let key = stream_key(market_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for event in events {
            let payload = event_to_bytes(event)?;
            pipe.xadd(&key, entry_id(event.seq_id), &[(PAYLOAD_FIELD, payload.as_ref())])
                .ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn read_since(&self, market_id: &str, after: u64) -> Result<Vec<Event>, PublishError> {
        let key = stream_key(market_id);
        let mut conn = self.conn.clone();
        let mut out = Vec::new();
        let mut after = after;
        loop {
            let reply: StreamRangeReply = conn
                .xrange_count(&key, first_after(after), "+", READ_BATCH)
                .await?;
            let done = reply.ids.len() < READ_BATCH;
            let events = Self::decode_reply(reply)?;
            if let Some(last) = events.last() {
                after = last.seq_id;
            }
            out.extend(events);
            if done {
                return Ok(out);
            }
        }
    }

    async fn last_sequence(&self, market_id: &str) -> Result<Option<(u64, u64)>, PublishError> {
        let key = stream_key(market_id);
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(&key, "+", "-", 1).await?;
        let Some(last) = Self::decode_reply(reply)?.pop() else {
            return Ok(None);
        };
        if let EventBody::NewTrade(t) = &last.body {
            return Ok(Some((last.seq_id, t.trade.seq_id)));
        }

        // Walk back in pages until the newest trade shows up.
        let mut before = last.seq_id;
        loop {
            let Some(end) = last_before(before) else {
                return Ok(Some((last.seq_id, 0)));
            };
            let reply: StreamRangeReply = conn.xrevrange_count(&key, end, "-", READ_BATCH).await?;
            let exhausted = reply.ids.len() < READ_BATCH;
            let page = Self::decode_reply(reply)?;
            if let Some(trade_seq) = page.iter().find_map(|e| match &e.body {
                EventBody::NewTrade(t) => Some(t.trade.seq_id),
                _ => None,
            }) {
                return Ok(Some((last.seq_id, trade_seq)));
            }
            match page.last() {
                Some(oldest) if !exhausted => before = oldest.seq_id,
                _ => return Ok(Some((last.seq_id, 0))),
            }
        }
    }
}
