use std::collections::HashMap;

use async_trait::async_trait;
use common::MessageId;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventStoreError, OutboxMessage, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// PostgreSQL event store. Events and outbox rows share one transaction.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the workspace migrations (events, outbox, inventory and discount tables).
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxMessage> {
        let headers_json: serde_json::Value = row.try_get("headers")?;

        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            topic: row.try_get("topic")?,
            message_type: row.try_get("message_type")?,
            payload: row.try_get("payload")?,
            headers: serde_json::from_value(headers_json)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.constraint() == Some("unique_aggregate_version"))
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append_with_outbox(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        validate_events_for_append(&events)?;
        let aggregate_id = events[0].aggregate_id;
        let last_version = events[events.len() - 1].version;

        let mut tx = self.pool.begin().await?;

        // Writers of the same aggregate queue up here until this transaction ends.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(aggregate_id.to_string())
            .execute(&mut *tx)
            .await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        let actual = Version::new(current.unwrap_or(0));
        if let Some(expected) = options.expected_version
            && actual != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            });
        }

        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (id, event_type, aggregate_id, aggregate_type, version, timestamp, payload, metadata) ",
        );
        let mut rows = Vec::with_capacity(events.len());
        for event in &events {
            rows.push((event, serde_json::to_value(&event.metadata)?));
        }
        insert.push_values(rows, |mut b, (event, metadata)| {
            b.push_bind(event.event_id.as_uuid())
                .push_bind(&event.event_type)
                .push_bind(event.aggregate_id.as_uuid())
                .push_bind(&event.aggregate_type)
                .push_bind(event.version.as_i64())
                .push_bind(event.timestamp)
                .push_bind(&event.payload)
                .push_bind(metadata);
        });
        insert.build().execute(&mut *tx).await.map_err(|err| {
            if unique_violation(&err) {
                EventStoreError::ConcurrencyConflict {
                    aggregate_id,
                    expected: options.expected_version.unwrap_or(actual),
                    actual: last_version,
                }
            } else {
                EventStoreError::Database(err)
            }
        })?;

        if !outbox.is_empty() {
            let mut rows = Vec::with_capacity(outbox.len());
            for message in &outbox {
                rows.push((message, serde_json::to_value(&message.headers)?));
            }
            let mut insert = QueryBuilder::<Postgres>::new(
                "INSERT INTO outbox (id, topic, message_type, payload, headers, created_at) ",
            );
            insert.push_values(rows, |mut b, (message, headers)| {
                b.push_bind(message.id.as_uuid())
                    .push_bind(&message.topic)
                    .push_bind(&message.message_type)
                    .push_bind(&message.payload)
                    .push_bind(headers)
                    .push_bind(message.created_at);
            });
            insert.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        if !outbox.is_empty() {
            metrics::counter!("outbox_messages_written_total").increment(outbox.len() as u64);
        }
        tracing::debug!(%aggregate_id, version = %last_version, events = events.len(), "events appended");

        Ok(last_version)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, aggregate_id, aggregate_type, version, timestamp, payload, metadata
            FROM events
            WHERE aggregate_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, message_type, payload, headers, created_at
            FROM outbox
            WHERE dispatched_at IS NULL
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_outbox_dispatched(&self, ids: &[MessageId]) -> Result<()> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();

        sqlx::query(
            "UPDATE outbox SET dispatched_at = now() WHERE id = ANY($1) AND dispatched_at IS NULL",
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
