use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize};

/// An integration message waiting to be published to the event bus.
///
/// Outbox messages are stored in the same atomic append as the events that produced
/// them. A relay publishes them afterwards and marks them dispatched; a crash between
/// publishing and marking leads to a second publish, which consumers tolerate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Becomes the bus message id, so consumers can correlate redeliveries.
    pub id: MessageId,
    pub topic: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: MessageId::new(),
            topic: topic.into(),
            message_type: message_type.into(),
            payload: serde_json::to_value(payload)?,
            headers: HashMap::new(),
            created_at: Utc::now(),
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_serializes_payload_and_keeps_routing() {
        let msg = OutboxMessage::new(
            "order.confirmed",
            "OrderConfirmed",
            &serde_json::json!({"order_id": "abc"}),
        )
        .unwrap()
        .with_header("x-correlation-id", "corr-1");

        assert_eq!(msg.topic, "order.confirmed");
        assert_eq!(msg.message_type, "OrderConfirmed");
        assert_eq!(msg.payload["order_id"], "abc");
        assert_eq!(msg.headers["x-correlation-id"], "corr-1");
    }
}
