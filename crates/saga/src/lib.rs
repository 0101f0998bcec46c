//! Order orchestrator for the order-fulfillment saga.
//!
//! [`OrderOrchestrator`] owns the order aggregate and runs the saga:
//!
//! 1. validate the discount code, place the order
//! 2. reserve stock (all or nothing); on shortfall the order ends Cancelled
//! 3. start payment and wait for the provider's outcome
//! 4. on success commit stock, record discount usage, confirm
//! 5. on failure, cancellation or a late payment, compensate: release or return
//!    stock, roll back the discount usage, request a refund
//!
//! Every order state change writes its integration events to the outbox in the
//! same transaction; [`OutboxRelay`] publishes them. [`PaymentOutcomeAdapter`]
//! turns provider callbacks into `PaymentSuccess` / `PaymentFailed` messages.

pub mod adapter;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod payment;
pub mod ports;
pub mod relay;

pub use adapter::{PaymentCallback, PaymentOutcome, PaymentOutcomeAdapter};
pub use error::{Result, SagaError};
pub use orchestrator::{OrchestratorConfig, OrderOrchestrator};
pub use payment::{
    InMemoryPaymentGateway, PaymentError, PaymentGateway, PaymentIntent, PaymentRequest, Refund,
};
pub use ports::{DiscountService, InventoryService};
pub use relay::OutboxRelay;
