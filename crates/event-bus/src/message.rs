use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{BusError, Result};

/// Delivery attempt counter, starting at 1. Survives requeues.
pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";
/// Why a message ended up in a dead-letter queue.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
pub const DEAD_LETTERED_AT_HEADER: &str = "x-dead-lettered-at";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// A typed integration event with a fixed message type and routing topic.
pub trait BusEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator stored in [`Message::message_type`].
    const MESSAGE_TYPE: &'static str;
    /// Routing key, e.g. `order.confirmed`.
    const TOPIC: &'static str;
}

/// Envelope carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub message_type: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Wraps a typed event under its own message type and topic.
    pub fn from_event<E: BusEvent>(event: &E) -> Result<Self> {
        Message::builder()
            .message_type(E::MESSAGE_TYPE)
            .topic(E::TOPIC)
            .payload(event)?
            .build()
    }

    pub fn decode<E: BusEvent>(&self) -> std::result::Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Current delivery attempt. A missing or garbled header counts as the first.
    pub fn attempt(&self) -> u32 {
        self.header(ATTEMPT_HEADER)
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    pub(crate) fn bump_attempt(&mut self) {
        let next = self.attempt().saturating_add(1);
        self.headers
            .insert(ATTEMPT_HEADER.to_string(), next.to_string());
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_HEADER)
    }
}

#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    message_type: Option<String>,
    topic: Option<String>,
    payload: Option<serde_json::Value>,
    headers: HashMap<String, String>,
}

impl MessageBuilder {
    /// Reuses an existing id, e.g. the outbox message id.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn build(self) -> Result<Message> {
        let message_type = self
            .message_type
            .ok_or_else(|| BusError::InvalidMessage("message_type is required".into()))?;
        let topic = self
            .topic
            .ok_or_else(|| BusError::InvalidMessage("topic is required".into()))?;
        if topic.is_empty() || topic.split('.').any(str::is_empty) {
            return Err(BusError::InvalidMessage(format!("invalid topic '{topic}'")));
        }

        Ok(Message {
            id: self.id.unwrap_or_default(),
            message_type,
            topic,
            payload: self.payload.unwrap_or(serde_json::Value::Null),
            headers: self.headers,
            published_at: Utc::now(),
        })
    }
}
