use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventStoreError, OutboxMessage, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

struct OutboxEntry {
    message: OutboxMessage,
    dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    /// Events per aggregate, in version order.
    streams: HashMap<AggregateId, Vec<EventEnvelope>>,
    outbox: Vec<OutboxEntry>,
}

impl State {
    fn head(&self, aggregate_id: AggregateId) -> Option<Version> {
        self.streams
            .get(&aggregate_id)
            .and_then(|stream| stream.last())
            .map(|event| event.version)
    }
}

/// Event store kept in process memory, for tests and database-less runs.
///
/// Streams and outbox sit behind one lock, so `append_with_outbox` is all-or-nothing
/// like the PostgreSQL transaction.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events stored across all aggregates.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.streams.values().map(Vec::len).sum()
    }

    /// Every outbox message ever written, dispatched or not.
    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        let state = self.state.read().await;
        state.outbox.iter().map(|entry| entry.message.clone()).collect()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_with_outbox(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        validate_events_for_append(&events)?;
        let (aggregate_id, from) = (events[0].aggregate_id, events[0].version);
        let to = events[events.len() - 1].version;

        let mut state = self.state.write().await;
        let actual = state.head(aggregate_id).unwrap_or_else(Version::initial);

        // A stale expectation, or versions that would collide with stored ones.
        let stale = options.expected_version.is_some_and(|expected| expected != actual);
        if stale || from <= actual {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: options.expected_version.unwrap_or(actual),
                actual,
            });
        }

        state.streams.entry(aggregate_id).or_default().extend(events);
        state.outbox.extend(outbox.into_iter().map(|message| OutboxEntry {
            message,
            dispatched_at: None,
        }));

        Ok(to)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let state = self.state.read().await;
        Ok(state.streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        Ok(self.state.read().await.head(aggregate_id))
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .filter(|entry| entry.dispatched_at.is_none())
            .take(limit)
            .map(|entry| entry.message.clone())
            .collect())
    }

    async fn mark_outbox_dispatched(&self, ids: &[MessageId]) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state
            .outbox
            .iter_mut()
            .filter(|entry| entry.dispatched_at.is_none() && ids.contains(&entry.message.id))
            .for_each(|entry| entry.dispatched_at = Some(now));
        Ok(())
    }
}
