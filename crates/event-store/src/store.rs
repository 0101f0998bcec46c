use async_trait::async_trait;
use common::MessageId;

use crate::{AggregateId, EventEnvelope, EventStoreError, OutboxMessage, Result, Version};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected version of the aggregate for optimistic concurrency control.
    /// If None, no version check is performed.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// The aggregate must not exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }

    /// Picks `expect_new` for version 0 and `expect_version` otherwise.
    pub fn expect_current(version: Version) -> Self {
        if version == Version::initial() {
            Self::expect_new()
        } else {
            Self::expect_version(version)
        }
    }
}

/// Core trait for event store implementations.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events and outbox messages in one atomic step.
    ///
    /// Either everything is stored or nothing is. If `options.expected_version` is set
    /// and does not match, fails with `ConcurrencyConflict` and stores nothing.
    /// Returns the new version of the aggregate.
    async fn append_with_outbox(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version>;

    /// Retrieves all events for an aggregate in version order.
    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>>;

    /// Gets the current version of an aggregate, or None if it has no events.
    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>>;

    /// Oldest undispatched outbox messages first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Marks outbox messages as published. Unknown ids are ignored.
    async fn mark_outbox_dispatched(&self, ids: &[MessageId]) -> Result<()>;
}

/// Convenience methods available on every event store.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends events without outbox messages.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        self.append_with_outbox(events, options, Vec::new()).await
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Checks that a batch targets one aggregate with consecutive versions.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty event list".to_string(),
        ));
    };

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        if event.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(
                "all events must be for the same aggregate".to_string(),
            ));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::InvalidAppend(
                "all events must have the same aggregate type".to_string(),
            ));
        }
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "event versions must be sequential: expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}
