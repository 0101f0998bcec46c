//! Saga error types.

use discount::DiscountError;
use domain::{DomainError, OrderError, OrderId};
use event_bus::BusError;
use event_store::EventStoreError;
use inventory::InventoryError;
use thiserror::Error;

use crate::payment::PaymentError;

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The discount code cannot be applied to the order.
    #[error("Discount rejected: {0}")]
    DiscountRejected(String),

    /// A payment outcome arrived before the order finished reserving stock.
    #[error("Order {0} is not awaiting payment yet")]
    PaymentNotExpected(OrderId),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Discount error: {0}")]
    Discount(#[from] DiscountError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

impl SagaError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::PaymentNotExpected(_) => true,
            SagaError::Domain(e) => e.is_transient(),
            SagaError::Inventory(e) => e.is_transient(),
            SagaError::Discount(e) => e.is_transient(),
            SagaError::Payment(e) => e.is_transient(),
            SagaError::Bus(e) => e.is_transient(),
            SagaError::EventStore(e) => e.is_transient(),
            SagaError::OrderNotFound(_) | SagaError::DiscountRejected(_) => false,
        }
    }

    /// A business outcome: reported to the caller, never retried.
    pub fn is_validation(&self) -> bool {
        match self {
            SagaError::DiscountRejected(_) => true,
            SagaError::Inventory(e) => e.is_validation(),
            SagaError::Discount(e) => e.is_validation(),
            SagaError::Domain(DomainError::Order(_)) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SagaError::OrderNotFound(_) => true,
            SagaError::Domain(e) => e.is_not_found(),
            SagaError::Discount(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// The order was in a status the command does not apply to.
    pub fn order_error(&self) -> Option<&OrderError> {
        match self {
            SagaError::Domain(DomainError::Order(e)) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SagaError>;
