//! Event store for event-sourced aggregates.
//!
//! Events are appended with optimistic concurrency control. Integration messages
//! destined for the event bus are written to an outbox in the same atomic append,
//! so a state change and its announcement can never diverge.

pub mod error;
pub mod event;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod store;

pub use common::{AggregateId, EventId};
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, Version};
pub use memory::InMemoryEventStore;
pub use outbox::OutboxMessage;
pub use postgres::PostgresEventStore;
pub use store::{AppendOptions, EventStore, EventStoreExt};
