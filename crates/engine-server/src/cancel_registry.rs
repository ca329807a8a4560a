//! Turns the fire-and-forget cancel pipeline into a request/response.
//!
//! A caller registers a waiter for the order it is about to cancel, sends
//! the cancel command, and awaits the waiter. The registry's consumer task
//! reads every published batch of its market and answers the waiter of the
//! first event that decides the order's fate.

use std::collections::HashMap;
use std::sync::Arc;

use engine_core::CancelOutcome;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::CancelError;
use crate::types::EventBatch;

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<CancelOutcome>>>>;

#[derive(Clone)]
pub struct CancelConfirmationRegistry {
    market_id: Arc<str>,
    waiters: Waiters,
    batches: mpsc::Sender<EventBatch>,
}

impl CancelConfirmationRegistry {
    /// Creates the registry and its consumer task. The task ends once every
    /// handle is dropped.
    pub fn spawn(market_id: &str, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<EventBatch>(capacity);
        let waiters: Waiters = Arc::default();
        let registry = CancelConfirmationRegistry {
            market_id: Arc::from(market_id),
            waiters: waiters.clone(),
            batches: tx,
        };
        let market = registry.market_id.clone();
        let task = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                resolve(&waiters, &batch);
            }
            debug!(market = %market, "cancel registry stopped");
        });
        (registry, task)
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    /// At most one waiter per order.
    pub fn get_waiter(&self, order_id: u64) -> Result<oneshot::Receiver<CancelOutcome>, CancelError> {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&order_id) {
            return Err(CancelError::AlreadyInProgress(order_id));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(order_id, tx);
        Ok(rx)
    }

    /// Cleanup for a caller that stopped waiting. Returns whether a waiter
    /// was still registered.
    pub fn remove_waiter(&self, order_id: u64) -> bool {
        self.waiters.lock().remove(&order_id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Hand a published batch to the consumer task.
    pub async fn dispatch(&self, batch: EventBatch) -> Result<(), CancelError> {
        self.batches
            .send(batch)
            .await
            .map_err(|_| CancelError::Closed(self.market_id.to_string()))
    }
}

fn resolve(waiters: &Waiters, batch: &EventBatch) {
    for event in batch.iter() {
        let Some((order_id, outcome)) = CancelOutcome::from_event(event) else {
            continue;
        };
        let waiter = waiters.lock().remove(&order_id);
        if let Some(tx) = waiter {
            trace!(order = order_id, outcome = outcome.as_str(), "cancel answered");
            // the caller may have given up already
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::{ErrorCode, ErrorEvent, Event, EventBody, Order, OrderStatus};

    fn status(id: u64, status: OrderStatus) -> Event {
        let mut order = Order::default();
        order.id = id;
        order.status = status;
        Event {
            seq_id: id,
            created_at: 0,
            market_id: "btcusdt".into(),
            body: EventBody::OrderStatusChange { order },
        }
    }

    fn cancel_failed(id: u64) -> Event {
        Event {
            seq_id: 100 + id,
            created_at: 0,
            market_id: "btcusdt".into(),
            body: EventBody::Error(ErrorEvent {
                code: ErrorCode::CancelFailed,
                order_id: id,
                owner_id: 0,
                message: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn second_waiter_is_rejected() {
        let (registry, _task) = CancelConfirmationRegistry::spawn("btcusdt", 8);
        let _first = registry.get_waiter(1).unwrap();
        assert_eq!(registry.get_waiter(1).unwrap_err(), CancelError::AlreadyInProgress(1));
        assert!(registry.remove_waiter(1));
        assert!(registry.get_waiter(1).is_ok());
    }

    #[tokio::test]
    async fn outcomes_follow_the_deciding_event() {
        let (registry, _task) = CancelConfirmationRegistry::spawn("btcusdt", 8);
        let ok = registry.get_waiter(1).unwrap();
        let filled = registry.get_waiter(2).unwrap();
        let failed = registry.get_waiter(3).unwrap();

        let batch = Arc::new(vec![
            status(1, OrderStatus::PartiallyFilled),
            status(1, OrderStatus::Cancelled),
            status(2, OrderStatus::Filled),
            cancel_failed(3),
        ]);
        registry.dispatch(batch).await.unwrap();

        assert_eq!(ok.await.unwrap(), CancelOutcome::Ok);
        assert_eq!(filled.await.unwrap(), CancelOutcome::AlreadyFilled);
        assert_eq!(failed.await.unwrap(), CancelOutcome::CancelFailedFromMe);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn events_without_waiters_are_ignored() {
        let (registry, _task) = CancelConfirmationRegistry::spawn("btcusdt", 8);
        let waiter = registry.get_waiter(9).unwrap();
        registry
            .dispatch(Arc::new(vec![status(4, OrderStatus::Cancelled), status(9, OrderStatus::Untouched)]))
            .await
            .unwrap();
        registry.dispatch(Arc::new(vec![status(9, OrderStatus::Cancelled)])).await.unwrap();
        assert_eq!(waiter.await.unwrap(), CancelOutcome::Ok);
    }
}
