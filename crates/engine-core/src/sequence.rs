//! Per-market event and trade numbering.

use crate::messages::{Event, EventBody};

/// Last issued event and trade sequence numbers of one market.
///
/// Both counters start from the values handed to
/// [`MatchingEngine::load`](crate::MatchingEngine::load) and only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sequencer {
    event_seq: u64,
    trade_seq: u64,
}

impl Sequencer {
    pub fn new(event_seq: u64, trade_seq: u64) -> Self {
        Sequencer { event_seq, trade_seq }
    }

    pub fn event_seq(&self) -> u64 {
        self.event_seq
    }

    pub fn trade_seq(&self) -> u64 {
        self.trade_seq
    }

    pub fn next_trade(&mut self) -> u64 {
        self.trade_seq += 1;
        self.trade_seq
    }

    /// Stamp `body` with the next event sequence number.
    pub fn event(&mut self, market_id: &str, created_at: i64, body: EventBody) -> Event {
        self.event_seq += 1;
        Event {
            seq_id: self.event_seq,
            created_at,
            market_id: market_id.to_string(),
            body,
        }
    }

    /// Move both counters forward to cover an already published event.
    pub fn observe(&mut self, event: &Event) {
        self.event_seq = self.event_seq.max(event.seq_id);
        if let EventBody::NewTrade(t) = &event.body {
            self.trade_seq = self.trade_seq.max(t.trade.seq_id);
        }
    }
}
