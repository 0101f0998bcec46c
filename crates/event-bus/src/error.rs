use thiserror::Error;

/// Errors raised by the bus itself (not by message handlers).
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("queue not declared: {0}")]
    QueueNotFound(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Whether reconnecting and retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
