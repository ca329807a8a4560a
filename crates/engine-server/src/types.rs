//! Shared types for the trading core runtime.
//!
//! This module defines:
//! - `ClientId`: a lightweight handle for connected ingress clients
//! - `EventBatch`: the events produced by one command, shared between the
//!   publisher, the fanout and the cancel registry
//! - the shutdown flag every long-running task watches

use std::sync::Arc;

use engine_core::Event;
use tokio::sync::watch;

/// Identifier for a connected client.
///
/// This is intentionally opaque; we just guarantee uniqueness
/// over the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// Events of one processed command, in stream order.
pub type EventBatch = Arc<Vec<Event>>;

/// `true` once shutdown was requested.
pub type ShutdownTx = watch::Sender<bool>;
pub type ShutdownRx = watch::Receiver<bool>;

pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn shutdown_requested(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
