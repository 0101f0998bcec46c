use thiserror::Error;

use crate::model::{Shortfall, StockKey};

#[derive(Debug, Error)]
pub enum InventoryError {
    /// At least one line could not be covered; nothing was reserved.
    #[error("insufficient stock: {}", format_shortfalls(.0))]
    InsufficientStock(Vec<Shortfall>),

    /// Another reservation changed the item between read and write.
    #[error("concurrent update on stock item {0}")]
    ConcurrencyConflict(StockKey),

    /// Conflict retries ran out.
    #[error("stock item {0} is under heavy contention, try again later")]
    Contention(StockKey),

    #[error("nothing to reserve")]
    NoLines,

    #[error("invalid quantity {quantity} for {product_id}")]
    InvalidQuantity { product_id: String, quantity: u32 },

    #[error("stock item {0} not found")]
    StockItemNotFound(StockKey),

    #[error("corrupt ledger row: {0}")]
    CorruptRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl InventoryError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            InventoryError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// A business outcome reported to the caller rather than a failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            InventoryError::InsufficientStock(_)
                | InventoryError::Contention(_)
                | InventoryError::NoLines
                | InventoryError::InvalidQuantity { .. }
        )
    }
}

fn format_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, InventoryError>;
