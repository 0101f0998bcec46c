use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{Message, error::Result};

/// A queue and the topic patterns bound to it.
///
/// Patterns follow AMQP topic exchange rules: segments are separated by `.`,
/// `*` matches exactly one segment and `#` matches zero or more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, pattern: impl Into<String>) -> Self {
        self.bindings.push(pattern.into());
        self
    }

    pub fn dead_letter_queue(&self) -> String {
        dead_letter_queue_name(&self.name)
    }

    pub fn accepts(&self, topic: &str) -> bool {
        self.bindings.iter().any(|p| topic_matches(p, topic))
    }
}

pub(crate) fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// A message handed to a consumer and not yet settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub message: Message,
}

impl Delivery {
    pub fn attempt(&self) -> u32 {
        self.message.attempt()
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt() > 1
    }
}

/// A message parked in a dead-letter queue.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub queue: String,
    pub reason: String,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub message: Message,
}

/// Transport contract the rest of the bus is written against.
///
/// Every delivery must be settled exactly once with [`ack`](Broker::ack),
/// [`requeue`](Broker::requeue) or [`dead_letter`](Broker::dead_letter). Unsettled
/// deliveries are redelivered once the channel that received them is
/// [`close`](Broker::close)d.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn ping(&self) -> Result<()>;

    /// Declares a queue with its bindings and its `<name>.dlq` companion.
    /// Re-declaring replaces the bindings and keeps queued messages.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<()>;

    /// Routes a message to every queue with a matching binding.
    /// Returns the number of queues it was delivered to.
    async fn publish(&self, message: Message) -> Result<usize>;

    /// Waits for the next message on a queue.
    async fn receive(&self, queue: &str) -> Result<Delivery>;

    async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Returns the message to the back of its queue with the attempt counter incremented.
    async fn requeue(&self, delivery: Delivery) -> Result<()>;

    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<()>;

    /// Gives up this channel. Deliveries it received and never settled go back to the
    /// front of their queues as redeliveries. Must succeed while the broker is down.
    async fn close(&self) -> Result<()>;

    /// Messages waiting on a queue, excluding unacknowledged deliveries.
    async fn queue_depth(&self, queue: &str) -> Result<usize>;

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>>;
}

/// AMQP-style topic matching.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    segments_match(&pattern, &topic)
}

fn segments_match(pattern: &[&str], topic: &[&str]) -> bool {
    match (pattern.split_first(), topic.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            segments_match(rest, topic)
                || topic
                    .split_first()
                    .is_some_and(|(_, tail)| segments_match(pattern, tail))
        }
        (Some((&"*", rest)), Some((_, tail))) => segments_match(rest, tail),
        (Some((p, rest)), Some((t, tail))) if p == t => segments_match(rest, tail),
        _ => false,
    }
}
