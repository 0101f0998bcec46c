use common::DiscountId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscountError {
    #[error("discount code {0} already exists")]
    DuplicateCode(String),

    #[error("discount {0} not found")]
    DiscountNotFound(DiscountId),

    #[error("invalid discount: {0}")]
    InvalidDiscount(String),

    #[error("corrupt discount row: {0}")]
    CorruptRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl DiscountError {
    pub fn is_transient(&self) -> bool {
        match self {
            DiscountError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DiscountError::DuplicateCode(_) | DiscountError::InvalidDiscount(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscountError::DiscountNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DiscountError>;
