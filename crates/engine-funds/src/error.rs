use engine_core::{ErrorCode, OrderError};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::balance::Balance;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FundsError {
    #[error("unknown user {user_id}")]
    InvalidUserBalance { user_id: u64 },

    #[error("unknown sub-account {sub_account_id} of user {user_id}")]
    InvalidUserBalanceAccount { user_id: u64, sub_account_id: u64 },

    #[error("unknown coin {0:?}")]
    InvalidCoinSymbol(String),

    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),

    /// The operation would take a balance past `Decimal`'s range. Nothing
    /// was written.
    #[error("{coin} balance out of range")]
    OutOfRange { coin: String },

    #[error("{coin}: {available} does not cover {required}")]
    InsufficientFunds {
        coin: String,
        available: Decimal,
        required: Decimal,
    },

    /// The order-side check run under the account lock refused.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// Settlement would leave a row negative or with `in_orders > locked`.
    /// Nothing was written.
    #[error("balance invariant violated for user {user_id}/{sub_account_id} {coin}: {attempted:?}")]
    InvariantViolation {
        user_id: u64,
        sub_account_id: u64,
        coin: String,
        attempted: Balance,
    },
}

impl FundsError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FundsError::InvalidUserBalance { .. } => ErrorCode::InvalidUserBalance,
            FundsError::InvalidUserBalanceAccount { .. } => ErrorCode::InvalidUserBalanceAccount,
            FundsError::InvalidCoinSymbol(_) => ErrorCode::InvalidCoinSymbol,
            FundsError::InvalidAmount(_) | FundsError::OutOfRange { .. } => ErrorCode::InvalidAmount,
            FundsError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            FundsError::Order(e) => e.code(),
            FundsError::InvariantViolation { .. } => ErrorCode::InvalidUserBalance,
        }
    }

    /// Only invariant violations are unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FundsError::InvariantViolation { .. })
    }
}
