//! Domain layer for the order fulfillment saga.
//!
//! This crate provides:
//! - Aggregate and DomainEvent traits for event-sourced entities
//! - CommandHandler, which persists events and their outbox messages atomically
//! - The Order aggregate with its status machine
//! - Typed contracts for the integration events exchanged over the bus

pub mod aggregate;
pub mod command;
pub mod contracts;
pub mod error;
pub mod order;
pub mod values;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{CommandHandler, CommandMetadata, CommandResult};
pub use error::DomainError;
pub use order::{
    CancellationPolicy, Order, OrderError, OrderEvent, OrderService, OrderStatus, PaymentStatus,
    PlaceOrder,
};
pub use values::{AppliedDiscount, Money, OrderId, OrderLine, ProductId, VariantId, WarehouseId};
