//! Loading aggregates and running commands against them.

use std::{collections::HashMap, marker::PhantomData};

use common::AggregateId;
use event_bus::CORRELATION_HEADER;
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, OutboxMessage, Version,
    event::{CAUSATION_ID, CORRELATION_ID},
};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// What a command did.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were generated and persisted. Empty when the command was a
    /// no-op, e.g. a duplicate delivery of something already applied.
    pub events: Vec<A::Event>,

    pub new_version: Version,

    /// Number of outbox messages written with the events.
    pub outbox_messages: usize,
}

impl<A: Aggregate> CommandResult<A> {
    pub fn changed(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Tracing data stored with every event a command produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandMetadata {
    /// What triggered the command, e.g. the id of the bus message being handled.
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl CommandMetadata {
    pub fn caused_by(causation_id: impl ToString) -> Self {
        Self {
            causation_id: Some(causation_id.to_string()),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn to_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        if let Some(causation) = &self.causation_id {
            map.insert(CAUSATION_ID.to_string(), causation.clone().into());
        }
        if let Some(correlation) = &self.correlation_id {
            map.insert(CORRELATION_ID.to_string(), correlation.clone().into());
        }
        map
    }
}

/// Loads aggregates from the event store, runs commands against them and persists
/// the resulting events together with their outbox messages.
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rebuilds an aggregate from its events. Unknown ids yield a default instance.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        self.store
            .get_events_for_aggregate(aggregate_id)
            .await?
            .into_iter()
            .try_fold(A::default(), |mut state, envelope| -> Result<A, DomainError> {
                state.apply(serde_json::from_value(envelope.payload)?);
                state.set_version(envelope.version);
                Ok(state)
            })
    }

    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        Ok(aggregate.id().is_some().then_some(aggregate))
    }

    /// Executes a command and persists the resulting events.
    ///
    /// The command sees the aggregate as of its latest version; the append expects that
    /// version, so a concurrent writer makes this fail with a concurrency conflict.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        metadata: &CommandMetadata,
        decide: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let mut state = self.load(aggregate_id).await?;
        let expected = state.version();

        let events = decide(&state)?;
        if events.is_empty() {
            return Ok(CommandResult {
                aggregate: state,
                events,
                new_version: expected,
                outbox_messages: 0,
            });
        }

        let envelopes = self.build_envelopes(aggregate_id, expected, &events, metadata)?;

        // Integration messages are derived from the state each event leaves behind.
        let mut outbox = Vec::new();
        for event in &events {
            state.apply(event.clone());
            outbox.extend(state.integration_messages(event)?);
        }
        let outbox = self.stamp_outbox(aggregate_id, outbox, metadata);
        let outbox_messages = outbox.len();

        let new_version = self
            .store
            .append_with_outbox(envelopes, AppendOptions::expect_current(expected), outbox)
            .await?;
        state.set_version(new_version);

        Ok(CommandResult {
            aggregate: state,
            events,
            new_version,
            outbox_messages,
        })
    }

    /// Like [`execute`](Self::execute), but reloads and re-runs the command when a
    /// concurrent writer got in first. The command is re-evaluated against fresh
    /// state each time, so it may legitimately decide there is nothing left to do.
    pub async fn execute_with_retry<F>(
        &self,
        aggregate_id: AggregateId,
        metadata: &CommandMetadata,
        max_retries: u32,
        decide: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let mut retries = 0;
        loop {
            match self.execute(aggregate_id, metadata, &decide).await {
                Err(DomainError::EventStore(EventStoreError::ConcurrencyConflict { .. }))
                    if retries < max_retries =>
                {
                    retries += 1;
                    metrics::counter!("command_conflict_retries_total", "aggregate" => A::aggregate_type())
                        .increment(1);
                    tracing::debug!(%aggregate_id, retries, "concurrent write, retrying command");
                }
                other => return other,
            }
        }
    }

    fn build_envelopes(
        &self,
        aggregate_id: AggregateId,
        after: Version,
        events: &[A::Event],
        metadata: &CommandMetadata,
    ) -> Result<Vec<EventEnvelope>, DomainError> {
        let metadata = metadata.to_map();
        let versions = std::iter::successors(Some(after.next()), |v| Some(v.next()));

        events
            .iter()
            .zip(versions)
            .map(|(event, version)| -> Result<EventEnvelope, DomainError> {
                Ok(EventEnvelope::builder()
                    .aggregate_id(aggregate_id)
                    .aggregate_type(A::aggregate_type())
                    .event_type(event.event_type())
                    .version(version)
                    .payload(event)?
                    .extend_metadata(&metadata)
                    .build()?)
            })
            .collect()
    }

    fn stamp_outbox(
        &self,
        aggregate_id: AggregateId,
        outbox: Vec<OutboxMessage>,
        metadata: &CommandMetadata,
    ) -> Vec<OutboxMessage> {
        let correlation = metadata
            .correlation_id
            .clone()
            .unwrap_or_else(|| aggregate_id.to_string());
        outbox
            .into_iter()
            .map(|msg| msg.with_header(CORRELATION_HEADER, correlation.clone()))
            .collect()
    }
}
