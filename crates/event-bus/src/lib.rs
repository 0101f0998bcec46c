//! Event bus shared by the order, inventory and discount services.
//!
//! Delivery is at least once: a message is acknowledged only after its handler
//! succeeded. Failed deliveries are redelivered with backoff until the attempt counter
//! carried in the message headers reaches the configured maximum, after which the
//! message moves to the queue's dead-letter queue.
//!
//! - [`Message`] / [`BusEvent`]: the envelope and the typed contracts carried in it
//! - [`Broker`]: the transport contract, with [`InMemoryBroker`] as implementation
//! - [`Connection`]: connection lifecycle with reconnect policy, shared by workers
//! - [`HandlerRegistry`]: message type to handler mapping with typed decoding
//! - [`Consumer`]: bounded worker pool that dispatches and settles deliveries

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod registry;

pub use broker::{Broker, DeadLetter, Delivery, QueueSpec, topic_matches};
pub use connection::{Connection, ConnectionState, Connector, InMemoryConnector};
pub use consumer::{Consumer, ConsumerConfig, DrainSummary, Settlement};
pub use error::{BusError, Result};
pub use memory::InMemoryBroker;
pub use message::{
    ATTEMPT_HEADER, BusEvent, CORRELATION_HEADER, DEAD_LETTER_REASON_HEADER, Message,
    MessageBuilder,
};
pub use registry::{EventHandler, HandlerError, HandlerRegistry, MessageContext};
