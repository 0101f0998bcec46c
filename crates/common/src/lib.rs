//! Shared building blocks used by every service in the saga.

pub mod retry;
pub mod types;

pub use retry::{Backoff, RetryPolicy, retry_async};
pub use types::{AggregateId, DiscountId, EventId, MessageId, ReservationId, UserId};
