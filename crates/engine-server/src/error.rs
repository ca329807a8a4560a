use engine_core::{Decimal, ErrorCode, OrderError};
use engine_funds::FundsError;
use engine_protocol::ProtocolError;
use thiserror::Error;

/// Persistence backend failures (sequences, orders, balances).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{key} is missing")]
    Missing { key: String },

    #[error("{key} holds unparseable value {value:?}")]
    Unparseable { key: String, value: String },
}

/// Event publisher failures.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("codec: {0}")]
    Codec(#[from] ProtocolError),

    #[error("stream entry {id} carries no event payload")]
    MalformedEntry { id: String },
}

/// Anything that ends an ingress connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A market engine could not recover its state.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("re-settling {market} events after {from}: {source}")]
    Settlement {
        market: String,
        from: u64,
        #[source]
        source: FundsError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("cancel already in progress for order {0}")]
    AlreadyInProgress(u64),

    #[error("cancel registry of {0} has stopped")]
    Closed(String),
}

/// Why the order queue refused a request.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown market {0}")]
    UnknownMarket(String),

    #[error("market {0} is not accepting this request")]
    MarketInactive(String),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Funds(#[from] FundsError),

    #[error("market {market} not allowed for bonus accounts")]
    MarketNotAllowed { market: String },

    #[error("free equity ratio {ratio} exceeds {threshold}")]
    HighRisk { ratio: Decimal, threshold: Decimal },

    #[error("price {price} is {pct}% of reference {reference}")]
    AbnormalPrice {
        price: Decimal,
        reference: Decimal,
        pct: Decimal,
    },

    #[error(transparent)]
    Cancel(#[from] CancelError),

    #[error("no answer for cancel of order {0} in time")]
    CancelTimeout(u64),

    #[error("market engine {0} has stopped")]
    EngineStopped(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} is out of range")]
    Overflow(&'static str),
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::UnknownMarket(_) => ErrorCode::InvalidOrder,
            QueueError::MarketInactive(_) => ErrorCode::MarketInactive,
            QueueError::Order(e) => e.code(),
            QueueError::Funds(e) => e.code(),
            QueueError::MarketNotAllowed { .. } => ErrorCode::MarketNotAllowedForAccount,
            QueueError::HighRisk { .. } => ErrorCode::HighRisk,
            QueueError::AbnormalPrice { .. } => ErrorCode::AbnormalPrice,
            QueueError::Cancel(CancelError::AlreadyInProgress(_)) => ErrorCode::CancelAlreadyInProgress,
            QueueError::Cancel(CancelError::Closed(_))
            | QueueError::CancelTimeout(_)
            | QueueError::EngineStopped(_) => ErrorCode::PublisherUnavailable,
            QueueError::Store(_) => ErrorCode::PersistenceUnavailable,
            QueueError::Overflow(_) => ErrorCode::InvalidAmount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_cover_queue_failures() {
        assert_eq!(
            QueueError::Cancel(CancelError::AlreadyInProgress(7)).code(),
            ErrorCode::CancelAlreadyInProgress
        );
        assert_eq!(
            QueueError::Funds(FundsError::InvalidCoinSymbol("x".into())).code(),
            ErrorCode::InvalidCoinSymbol
        );
        assert_eq!(
            QueueError::Store(StoreError::Missing { key: "k".into() }).code(),
            ErrorCode::PersistenceUnavailable
        );
        assert_eq!(QueueError::Order(OrderError::ZeroAmount).code(), ErrorCode::InvalidOrder);
    }
}
