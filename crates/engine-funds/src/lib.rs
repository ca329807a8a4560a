//! engine-funds
//!
//! The in-memory balance ledger shared by every market:
//! - [`balance`]   : balance rows and account keys
//! - [`engine`]    : the locked ledger and its atomic operations
//! - [`operation`] : deposit/withdrawal mutations as data

pub mod balance;
pub mod error;
pub mod engine;
pub mod operation;

pub use balance::{AccountKey, Balance, BalanceRow};
pub use engine::FundsEngine;
pub use error::FundsError;
pub use operation::FundsOperation;
