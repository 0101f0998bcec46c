//! Discount usage tracker.
//!
//! Owns discount definitions and the per-order usage records. An order has at most
//! one usage record; recording it again is a no-op and rolling it back only flips its
//! status, so statistics keep every usage ever made.

pub mod error;
pub mod handlers;
pub mod model;
pub mod store;
pub mod tracker;

pub use error::{DiscountError, Result};
pub use model::{
    Discount, DiscountKind, DiscountLine, DiscountUsage, DiscountValidation, LimitScope,
    NewDiscount, RecordOutcome, RecordUsage, RollbackOutcome, UsageStats, UsageStatus,
    normalize_code,
};
pub use store::{DiscountStore, InMemoryDiscountStore, PostgresDiscountStore};
pub use tracker::DiscountTracker;
