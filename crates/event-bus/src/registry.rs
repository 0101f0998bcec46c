use std::{collections::HashMap, fmt::Display, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use common::MessageId;
use thiserror::Error;

use crate::{BusEvent, Message};

/// How a handler failed, which decides how the delivery is settled.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Worth retrying: a dependency was down or a write conflicted.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The message can never be processed; retrying would not help.
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("malformed {message_type} payload: {reason}")]
    Malformed {
        message_type: String,
        reason: String,
    },

    #[error("no handler registered for message type {0}")]
    Unroutable(String),
}

impl HandlerError {
    pub fn transient(err: impl Display) -> Self {
        HandlerError::Transient(err.to_string())
    }

    pub fn rejected(err: impl Display) -> Self {
        HandlerError::Rejected(err.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Delivery details handed to a handler next to the decoded event.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: MessageId,
    pub message_type: String,
    pub queue: String,
    pub attempt: u32,
    pub correlation_id: Option<String>,
}

impl MessageContext {
    pub fn from_message(message: &Message, queue: &str) -> Self {
        Self {
            message_id: message.id,
            message_type: message.message_type.clone(),
            queue: queue.to_string(),
            attempt: message.attempt(),
            correlation_id: message.correlation_id().map(str::to_string),
        }
    }
}

/// A typed handler for one integration event.
///
/// Delivery is at least once, so implementations must be idempotent.
#[async_trait]
pub trait EventHandler<E: BusEvent>: Send + Sync + 'static {
    async fn handle(&self, event: E, ctx: &MessageContext) -> Result<(), HandlerError>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type BoxedHandler = Box<dyn Fn(Message, MessageContext) -> HandlerFuture + Send + Sync>;

/// Maps message types to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure for `E`. A later registration for the same type replaces it.
    pub fn on<E, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        E: BusEvent,
        F: Fn(E, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(
            move |message: Message, ctx: MessageContext| -> HandlerFuture {
                match message.decode::<E>() {
                    Ok(event) => Box::pin(handler(event, ctx)),
                    Err(err) => {
                        let malformed = HandlerError::Malformed {
                            message_type: message.message_type,
                            reason: err.to_string(),
                        };
                        Box::pin(async move { Err(malformed) })
                    }
                }
            },
        );

        if self.handlers.insert(E::MESSAGE_TYPE, boxed).is_some() {
            tracing::warn!(
                message_type = E::MESSAGE_TYPE,
                "replaced existing handler registration"
            );
        }
        self
    }

    pub fn register<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: BusEvent,
        H: EventHandler<E>,
    {
        let handler = Arc::new(handler);
        self.on::<E, _, _>(move |event, ctx| {
            let handler = handler.clone();
            async move { handler.handle(event, &ctx).await }
        })
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Decodes the message and runs its handler.
    pub async fn dispatch(&self, message: &Message, queue: &str) -> Result<(), HandlerError> {
        let Some(handler) = self.handlers.get(message.message_type.as_str()) else {
            return Err(HandlerError::Unroutable(message.message_type.clone()));
        };
        let ctx = MessageContext::from_message(message, queue);
        handler(message.clone(), ctx).await
    }
}
