//! Bus consumers owned by the order side: payment outcomes, cancellation
//! requests and refunds.

use std::sync::Arc;

use async_trait::async_trait;
use domain::CommandMetadata;
use domain::contracts::{
    OrderCancellationRequested, PaymentFailed, PaymentSuccess, RefundRequested, topics,
};
use event_bus::{EventHandler, HandlerError, HandlerRegistry, MessageContext, QueueSpec};
use event_store::EventStore;

use crate::SagaError;
use crate::orchestrator::OrderOrchestrator;
use crate::payment::{PaymentError, PaymentGateway};
use crate::ports::{DiscountService, InventoryService};

pub const QUEUE: &str = "orders.payment-events";
pub const REFUND_QUEUE: &str = "payments.refunds";

pub fn queue_spec() -> QueueSpec {
    QueueSpec::new(QUEUE)
        .bind(topics::PAYMENT_SUCCEEDED)
        .bind(topics::PAYMENT_FAILED)
        .bind(topics::ORDER_CANCELLATION_REQUESTED)
}

pub fn refund_queue_spec() -> QueueSpec {
    QueueSpec::new(REFUND_QUEUE).bind(topics::PAYMENT_REFUND_REQUESTED)
}

fn command_meta(ctx: &MessageContext) -> CommandMetadata {
    let meta = CommandMetadata::caused_by(ctx.message_id);
    match &ctx.correlation_id {
        Some(correlation_id) => meta.with_correlation(correlation_id.clone()),
        None => meta,
    }
}

fn handler_error(err: SagaError) -> HandlerError {
    if err.is_transient() {
        HandlerError::transient(err)
    } else {
        HandlerError::rejected(err)
    }
}

pub struct OrchestratorHandler<S, I, D, P>
where
    S: EventStore + 'static,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    orchestrator: Arc<OrderOrchestrator<S, I, D, P>>,
}

impl<S, I, D, P> Clone for OrchestratorHandler<S, I, D, P>
where
    S: EventStore + 'static,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
        }
    }
}

pub fn register_handlers<S, I, D, P>(
    registry: &mut HandlerRegistry,
    orchestrator: Arc<OrderOrchestrator<S, I, D, P>>,
) where
    S: EventStore + 'static,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    let handler = OrchestratorHandler { orchestrator };
    registry
        .register::<PaymentSuccess, _>(handler.clone())
        .register::<PaymentFailed, _>(handler.clone())
        .register::<OrderCancellationRequested, _>(handler);
}

#[async_trait]
impl<S, I, D, P> EventHandler<PaymentSuccess> for OrchestratorHandler<S, I, D, P>
where
    S: EventStore + 'static,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    async fn handle(&self, event: PaymentSuccess, ctx: &MessageContext) -> Result<(), HandlerError> {
        let order = self
            .orchestrator
            .handle_payment_success(event.order_id, &event.transaction_id, &command_meta(ctx))
            .await
            .map_err(handler_error)?;
        tracing::debug!(order_id = %event.order_id, status = %order.status(), attempt = ctx.attempt, "handled PaymentSuccess");
        Ok(())
    }
}

#[async_trait]
impl<S, I, D, P> EventHandler<PaymentFailed> for OrchestratorHandler<S, I, D, P>
where
    S: EventStore + 'static,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    async fn handle(&self, event: PaymentFailed, ctx: &MessageContext) -> Result<(), HandlerError> {
        let result = self
            .orchestrator
            .handle_payment_failed(
                event.order_id,
                &event.error_message,
                &event.failure_reason,
                &command_meta(ctx),
            )
            .await;

        match result {
            Ok(order) => {
                tracing::debug!(order_id = %event.order_id, status = %order.status(), "handled PaymentFailed");
                Ok(())
            }
            // Lost a race with a cancellation; the order is already settled.
            Err(err) if err.order_error().is_some() => {
                tracing::warn!(order_id = %event.order_id, error = %err, "payment failure not applied");
                Ok(())
            }
            Err(err) => Err(handler_error(err)),
        }
    }
}

#[async_trait]
impl<S, I, D, P> EventHandler<OrderCancellationRequested> for OrchestratorHandler<S, I, D, P>
where
    S: EventStore + 'static,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    async fn handle(
        &self,
        event: OrderCancellationRequested,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let result = self
            .orchestrator
            .cancel_order(
                event.order_id,
                &event.reason,
                event.requested_by.as_deref(),
                &command_meta(ctx),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // A refused cancellation is an answer, not a processing failure.
            Err(err) if err.order_error().is_some() => {
                tracing::warn!(order_id = %event.order_id, error = %err, "cancellation refused");
                Ok(())
            }
            Err(err) => Err(handler_error(err)),
        }
    }
}

/// Sends refunds to the payment provider.
pub struct RefundHandler<P: PaymentGateway> {
    gateway: Arc<P>,
}

impl<P: PaymentGateway> RefundHandler<P> {
    pub fn new(gateway: Arc<P>) -> Self {
        Self { gateway }
    }
}

pub fn register_refund_handler<P: PaymentGateway>(registry: &mut HandlerRegistry, gateway: Arc<P>) {
    registry.register::<RefundRequested, _>(RefundHandler::new(gateway));
}

#[async_trait]
impl<P: PaymentGateway> EventHandler<RefundRequested> for RefundHandler<P> {
    async fn handle(&self, event: RefundRequested, ctx: &MessageContext) -> Result<(), HandlerError> {
        self.gateway
            .refund(&event.transaction_id, event.amount, &event.reason)
            .await
            .map_err(|err: PaymentError| {
                if err.is_transient() {
                    HandlerError::transient(err)
                } else {
                    HandlerError::rejected(err)
                }
            })?;

        metrics::counter!("saga_refunds_issued_total").increment(1);
        tracing::info!(
            order_id = %event.order_id,
            transaction_id = %event.transaction_id,
            amount = %event.amount,
            attempt = ctx.attempt,
            "refund issued"
        );
        Ok(())
    }
}
