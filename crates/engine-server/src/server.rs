//! TCP listener of the command ingress.
//!
//! This module:
//! - Listens on the configured address/port.
//! - Accepts new TCP connections up to `max_clients`.
//! - Assigns each connection a `ClientId`.
//! - Spawns a per-client task that serves its requests against the
//!   order queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client;
use crate::config::Config;
use crate::order_queue::OrderQueue;
use crate::types::{shutdown_requested, ClientId, ShutdownRx};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> ClientId {
    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    ClientId(id)
}

/// Counts a connection for as long as it lives.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bind the configured address and serve until shutdown.
pub async fn run(config: &Config, queue: Arc<OrderQueue>, shutdown: ShutdownRx) -> anyhow::Result<()> {
    let addr = config.socket_addr_string();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, max_clients = config.max_clients, "ingress listening");
    serve(listener, config.max_clients, queue, shutdown).await
}

/// Accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    max_clients: usize,
    queue: Arc<OrderQueue>,
    mut shutdown: ShutdownRx,
) -> anyhow::Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted.context("accepting connection")?,
            _ = shutdown_requested(&mut shutdown) => {
                info!("ingress stopped accepting");
                return Ok(());
            }
        };

        if active.load(Ordering::Acquire) >= max_clients {
            warn!(peer = %peer_addr, max_clients, "rejecting connection, max_clients reached");
            // dropping the stream closes it
            continue;
        }
        active.fetch_add(1, Ordering::AcqRel);
        let slot = ConnectionSlot(active.clone());

        let client_id = next_client_id();
        debug!(client = client_id.0, peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            warn!(client = client_id.0, error = %err, "could not disable nagle");
        }

        let queue = queue.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let _slot = slot;
            match client::run_client(client_id, stream, queue, stop).await {
                Ok(()) => debug!(client = client_id.0, "client disconnected"),
                Err(err) => warn!(client = client_id.0, error = %err, "client error"),
            }
        });
    }
}
