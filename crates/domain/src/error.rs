//! Domain error types.

use event_store::EventStoreError;
use thiserror::Error;

use crate::order::OrderError;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The order rejected the command.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Whether retrying the same command later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DomainError::EventStore(err) => {
                err.is_transient() || matches!(err, EventStoreError::ConcurrencyConflict { .. })
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::AggregateNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
