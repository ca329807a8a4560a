//! Error types shared by the engine and the layers around it.
//!
//! [`ErrorCode`] is the stable, wire-visible code carried by `Error`
//! events and by rejected ingress requests. [`OrderError`] is the rich
//! validation error for a single order; it always maps onto one code.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("invalid_order")]
    InvalidOrder,
    #[error("invalid_amount")]
    InvalidAmount,
    #[error("invalid_coin_symbol")]
    InvalidCoinSymbol,
    #[error("invalid_user_balance")]
    InvalidUserBalance,
    #[error("invalid_user_balance_account")]
    InvalidUserBalanceAccount,
    #[error("market_inactive")]
    MarketInactive,
    #[error("insufficient_funds")]
    InsufficientFunds,
    #[error("cancel_failed")]
    CancelFailed,
    #[error("cancel_already_in_progress")]
    CancelAlreadyInProgress,
    #[error("high_risk")]
    HighRisk,
    #[error("abnormal_price")]
    AbnormalPrice,
    #[error("market_not_allowed_for_account")]
    MarketNotAllowedForAccount,
    #[error("persistence_unavailable")]
    PersistenceUnavailable,
    #[error("publisher_unavailable")]
    PublisherUnavailable,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 14] = [
        ErrorCode::InvalidOrder,
        ErrorCode::InvalidAmount,
        ErrorCode::InvalidCoinSymbol,
        ErrorCode::InvalidUserBalance,
        ErrorCode::InvalidUserBalanceAccount,
        ErrorCode::MarketInactive,
        ErrorCode::InsufficientFunds,
        ErrorCode::CancelFailed,
        ErrorCode::CancelAlreadyInProgress,
        ErrorCode::HighRisk,
        ErrorCode::AbnormalPrice,
        ErrorCode::MarketNotAllowedForAccount,
        ErrorCode::PersistenceUnavailable,
        ErrorCode::PublisherUnavailable,
    ];

    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::InvalidOrder => 1,
            ErrorCode::InvalidAmount => 2,
            ErrorCode::InvalidCoinSymbol => 3,
            ErrorCode::InvalidUserBalance => 4,
            ErrorCode::InvalidUserBalanceAccount => 5,
            ErrorCode::MarketInactive => 6,
            ErrorCode::InsufficientFunds => 7,
            ErrorCode::CancelFailed => 8,
            ErrorCode::CancelAlreadyInProgress => 9,
            ErrorCode::HighRisk => 10,
            ErrorCode::AbnormalPrice => 11,
            ErrorCode::MarketNotAllowedForAccount => 12,
            ErrorCode::PersistenceUnavailable => 13,
            ErrorCode::PublisherUnavailable => 14,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        ErrorCode::ALL.iter().copied().find(|c| c.as_u32() == v)
    }
}

/// Why an order was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("order id must be non-zero")]
    ZeroId,
    #[error("order belongs to market {found}, expected {expected}")]
    WrongMarket { expected: String, found: String },
    #[error("duplicate order id {0}")]
    DuplicateId(u64),
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
    #[error("{field} is out of range")]
    TooLarge { field: &'static str },
    #[error("limit price must be positive")]
    MissingPrice,
    #[error("market order funds must be positive")]
    MissingFunds,
    #[error("stop price must be positive")]
    MissingStopPrice,
    #[error("invalid {kind} order: {reason}")]
    InvalidComposite { kind: &'static str, reason: &'static str },
    #[error("price {price} exceeds market maximum {max}")]
    PriceTooHigh { price: Decimal, max: Decimal },
    #[error("volume {volume} below market minimum {min}")]
    BelowMinVolume { volume: Decimal, min: Decimal },
    #[error("quote volume {volume} below market minimum {min}")]
    BelowMinQuoteVolume { volume: Decimal, min: Decimal },
    #[error("available {available} does not cover {required}")]
    InsufficientFunds { available: Decimal, required: Decimal },
}

impl OrderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrderError::Negative { .. } | OrderError::TooLarge { .. } => ErrorCode::InvalidAmount,
            OrderError::BelowMinVolume { .. } | OrderError::BelowMinQuoteVolume { .. } => {
                ErrorCode::InvalidAmount
            }
            OrderError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            _ => ErrorCode::InvalidOrder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_round_trip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_u32(code.as_u32()), Some(code));
        }
        assert_eq!(ErrorCode::from_u32(0), None);
    }

    #[test]
    fn display_is_the_wire_name() {
        assert_eq!(ErrorCode::CancelAlreadyInProgress.to_string(), "cancel_already_in_progress");
        assert_eq!(
            OrderError::InsufficientFunds {
                available: Decimal::ONE,
                required: Decimal::TWO
            }
            .code(),
            ErrorCode::InsufficientFunds
        );
    }
}
