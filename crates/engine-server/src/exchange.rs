//! Wiring for the whole trading core.
//!
//! Start order: funds engine warmed from the ledger, then per market its
//! cancel registry and market engine (sequences, open orders and the event
//! log tail), then the order queue and the checkpoint ticker. Each piece is
//! built here and handed to the ones that need it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use engine_funds::{AccountKey, FundsEngine};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel_registry::CancelConfirmationRegistry;
use crate::config::{Config, ExchangeConfig};
use crate::ledger::{BalanceLedger, Checkpointer, MemoryLedger, RedisLedger};
use crate::market_engine::{MarketDeps, MarketEngine, MarketSettings};
use crate::order_queue::OrderQueue;
use crate::order_store::{MemoryOrderStore, OrderStore, RedisOrderStore};
use crate::publisher::{EventPublisher, MemoryPublisher, RedisStreamPublisher};
use crate::risk::{RiskPolicy, StaticRates, StaticRiskData};
use crate::sequence::{MemorySequenceStore, RedisSequenceStore, SequenceStore};
use crate::types::{shutdown_channel, shutdown_requested, ShutdownRx, ShutdownTx};

/// Persistence and publishing backends.
#[derive(Clone)]
pub struct Backends {
    pub sequences: Arc<dyn SequenceStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub orders: Arc<dyn OrderStore>,
    pub ledger: Arc<dyn BalanceLedger>,
}

impl Backends {
    pub fn memory() -> Self {
        Backends {
            sequences: Arc::new(MemorySequenceStore::new()),
            publisher: Arc::new(MemoryPublisher::new()),
            orders: Arc::new(MemoryOrderStore::new()),
            ledger: Arc::new(MemoryLedger::new()),
        }
    }

    pub async fn redis(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("invalid redis url {url:?}"))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("connecting to redis")?;
        Ok(Backends {
            sequences: Arc::new(RedisSequenceStore::new(conn.clone())),
            publisher: Arc::new(RedisStreamPublisher::new(conn.clone())),
            orders: Arc::new(RedisOrderStore::new(conn.clone())),
            ledger: Arc::new(RedisLedger::new(conn)),
        })
    }

    /// Redis when configured, in-memory otherwise.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        match &config.redis_url {
            Some(url) => {
                info!(url = %url, "using redis backends");
                Self::redis(url).await
            }
            None => {
                warn!("ENGINE_REDIS_URL unset, state lives in memory only");
                Ok(Self::memory())
            }
        }
    }
}

/// The running trading core.
pub struct TradingCore {
    queue: Arc<OrderQueue>,
    funds: Arc<FundsEngine>,
    checkpointer: Arc<Checkpointer>,
    markets: Vec<JoinHandle<()>>,
    registries: Vec<JoinHandle<()>>,
    ticker: JoinHandle<()>,
    shutdown: ShutdownTx,
}

impl TradingCore {
    pub async fn start(config: &Config, exchange: ExchangeConfig) -> anyhow::Result<Self> {
        let backends = Backends::from_config(config).await?;
        Self::start_with(config, exchange, backends).await
    }

    pub async fn start_with(config: &Config, exchange: ExchangeConfig, backends: Backends) -> anyhow::Result<Self> {
        let funds = Arc::new(FundsEngine::new(exchange.coins()));
        let settled = match backends.ledger.load().await.context("loading balance checkpoint")? {
            Some(snapshot) => {
                let rows = funds.load(snapshot.rows).context("warming funds engine")?;
                info!(rows, accounts = funds.account_count(), "funds engine warmed");
                snapshot.settled
            }
            None => {
                info!("no balance checkpoint, starting with an empty ledger");
                BTreeMap::new()
            }
        };
        let revenue = AccountKey::new(exchange.fees.revenue_user_id, exchange.fees.revenue_sub_account_id);
        funds.ensure_account(revenue.user_id, revenue.sub_account_id);

        let checkpointer = Arc::new(Checkpointer::new(funds.clone(), backends.ledger.clone(), settled));
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let deps = MarketDeps {
            funds: funds.clone(),
            checkpointer: checkpointer.clone(),
            publisher: backends.publisher.clone(),
            sequences: backends.sequences.clone(),
            orders: backends.orders.clone(),
            revenue,
        };
        let settings = MarketSettings {
            orders_capacity: config.orders_capacity,
            events_capacity: config.events_capacity,
            snapshot_interval: config.snapshot_interval,
        };

        let mut handles = Vec::with_capacity(exchange.markets.len());
        let mut markets = Vec::with_capacity(exchange.markets.len());
        let mut registries = Vec::with_capacity(exchange.markets.len());
        for market in &exchange.markets {
            let (registry, registry_task) = CancelConfirmationRegistry::spawn(&market.id, config.events_capacity);
            registries.push(registry_task);
            let (handle, task) =
                MarketEngine::start(market.clone(), deps.clone(), registry, settings, shutdown_rx.clone())
                    .await
                    .with_context(|| format!("starting market {}", market.id))?;
            handles.push(handle);
            markets.push(task);
        }

        let rates = Arc::new(StaticRates::from_config(&exchange));
        let risk = RiskPolicy::new(exchange.risk.clone(), rates, Arc::new(StaticRiskData::new(&exchange.bonus)));
        let queue = Arc::new(OrderQueue::new(
            funds.clone(),
            handles,
            backends.orders.clone(),
            risk,
            exchange.fees.clone(),
            config.cancel_timeout,
        ));

        let ticker = spawn_checkpoints(checkpointer.clone(), config.snapshot_interval, shutdown_rx);
        info!(markets = markets.len(), "trading core started");
        Ok(TradingCore {
            queue,
            funds,
            checkpointer,
            markets,
            registries,
            ticker,
            shutdown: shutdown_tx,
        })
    }

    pub fn queue(&self) -> Arc<OrderQueue> {
        self.queue.clone()
    }

    pub fn funds(&self) -> &Arc<FundsEngine> {
        &self.funds
    }

    pub fn shutdown_signal(&self) -> ShutdownRx {
        self.shutdown.subscribe()
    }

    /// Drain every market, then write the last balance checkpoint.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("trading core shutting down");
        let _ = self.shutdown.send(true);
        for task in self.markets {
            task.await.context("market engine task")?;
        }
        self.ticker.await.context("checkpoint ticker")?;
        let rows = self.checkpointer.checkpoint().await.context("final balance checkpoint")?;
        info!(rows, "final balance checkpoint written");
        for task in self.registries {
            task.abort();
        }
        Ok(())
    }
}

fn spawn_checkpoints(checkpointer: Arc<Checkpointer>, interval: Duration, mut stop: ShutdownRx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick is immediate
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => checkpointer.checkpoint_logged("interval").await,
                _ = shutdown_requested(&mut stop) => break,
            }
        }
    })
}
