//! engine-core
//!
//! Pure trading-core logic for one spot market:
//! - markets, orders and their status DAG
//! - commands (input) and events (output)
//! - the price-time priority order book with its stop-trigger set
//! - composite order state machines (OCO, OTO, strangle, straddle,
//!   trailing stop)
//! - the per-market matching engine that ties them together
//!
//! No async, no I/O: the server crate drives this from its own tasks.

pub mod side;
pub mod order_type;
pub mod status;
pub mod market;
pub mod error;
pub mod order;
pub mod messages;
pub mod sequence;
pub mod stops;
pub mod order_book;
pub mod composite;
pub mod matching_engine;

pub use side::Side;
pub use order_type::{OrderType, OtoType, StopType, TsPriceType};
pub use status::OrderStatus;
pub use market::{Market, MarketStatus};
pub use error::{ErrorCode, OrderError};
pub use order::{Order, MAX_MAGNITUDE};

pub use messages::{
    CancelOutcome,
    CommandType,
    ErrorEvent,
    Event,
    EventBody,
    NewTrade,
    OrderCommand,
    Trade,
};

pub use sequence::Sequencer;
pub use order_book::OrderBook;
pub use matching_engine::MatchingEngine;

/// Re-exported so downstream crates share one decimal type.
pub use rust_decimal::Decimal;
