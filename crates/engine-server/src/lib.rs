//! engine-server
//!
//! Async runtime around the trading core:
//! - one [`MarketEngine`](market_engine::MarketEngine) per market, fed by the
//!   [`OrderQueue`](order_queue::OrderQueue) and publishing its event stream
//! - the [`EventFanout`](fanout::EventFanout) that settles that stream into
//!   the funds engine
//! - the cancel registry, sequence saver, order store and balance ledger
//! - a length-prefixed binary TCP ingress

pub mod config;
pub mod error;
pub mod types;
pub mod sequence;
pub mod publisher;
pub mod order_store;
pub mod ledger;
pub mod cancel_registry;
pub mod fanout;
pub mod risk;
pub mod market_engine;
pub mod order_queue;
pub mod exchange;
pub mod server;

// internal, not re-exported
mod client;

pub use config::{Config, ExchangeConfig};
pub use error::{CancelError, ClientError, PublishError, QueueError, StartupError, StoreError};
pub use exchange::{Backends, TradingCore};
pub use market_engine::{MarketEngine, MarketHandle};
pub use order_queue::OrderQueue;
