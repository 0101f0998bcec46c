use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, EventId, EventStoreError};

/// Metadata key holding the id of the bus message that caused an event.
pub const CAUSATION_ID: &str = "causation_id";

/// Metadata key holding the correlation id shared by every event of one saga run.
pub const CORRELATION_ID: &str = "correlation_id";

/// Version number for an aggregate, used for optimistic concurrency control.
///
/// A new aggregate is at version 0; the first event takes it to version 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of an aggregate that has no events yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version after the first event.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored event together with the information needed to route and replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,

    /// The type of the event (e.g. "PaymentConfirmed").
    pub event_type: String,

    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g. "Order").
    pub aggregate_type: String,

    /// The version of the aggregate after this event.
    pub version: Version,

    pub timestamp: DateTime<Utc>,

    pub payload: serde_json::Value,

    /// Free-form metadata. See [`CAUSATION_ID`] and [`CORRELATION_ID`].
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Id of the bus message that caused this event, if recorded.
    pub fn causation_id(&self) -> Option<&str> {
        self.metadata.get(CAUSATION_ID).and_then(|v| v.as_str())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID).and_then(|v| v.as_str())
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Copies every entry of `metadata` onto the envelope.
    pub fn extend_metadata(mut self, metadata: &HashMap<String, serde_json::Value>) -> Self {
        self.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Builds the envelope with a fresh id and the current time.
    pub fn build(self) -> Result<EventEnvelope, EventStoreError> {
        let missing = |field: &str| EventStoreError::InvalidAppend(format!("{field} is required"));

        Ok(EventEnvelope {
            event_id: EventId::new(),
            event_type: self.event_type.ok_or_else(|| missing("event_type"))?,
            aggregate_id: self.aggregate_id.ok_or_else(|| missing("aggregate_id"))?,
            aggregate_type: self
                .aggregate_type
                .ok_or_else(|| missing("aggregate_type"))?,
            version: self.version.ok_or_else(|| missing("version"))?,
            timestamp: Utc::now(),
            payload: self.payload.ok_or_else(|| missing("payload"))?,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn builder_sets_causation_metadata() {
        let aggregate_id = AggregateId::new();
        let envelope = EventEnvelope::builder()
            .event_type("PaymentConfirmed")
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .version(Version::new(3))
            .payload_raw(serde_json::json!({"transaction_id": "tx-1"}))
            .metadata(CAUSATION_ID, serde_json::json!("msg-42"))
            .build()
            .unwrap();

        assert_eq!(envelope.aggregate_id, aggregate_id);
        assert_eq!(envelope.version, Version::new(3));
        assert_eq!(envelope.causation_id(), Some("msg-42"));
        assert_eq!(envelope.correlation_id(), None);
    }

    #[test]
    fn build_reports_missing_fields() {
        let err = EventEnvelope::builder()
            .event_type("OrderPlaced")
            .build()
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(msg) if msg.contains("aggregate_id")));
    }
}
