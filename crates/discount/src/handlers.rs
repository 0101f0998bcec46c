//! Bus consumers: discount usage follows order confirmation and cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use domain::contracts::{OrderCancelled, OrderConfirmed, topics};
use event_bus::{EventHandler, HandlerError, HandlerRegistry, MessageContext, QueueSpec};

use crate::DiscountError;
use crate::model::{RecordOutcome, RecordUsage};
use crate::store::DiscountStore;
use crate::tracker::DiscountTracker;

pub const QUEUE: &str = "discount.order-events";

pub fn queue_spec() -> QueueSpec {
    QueueSpec::new(QUEUE)
        .bind(topics::ORDER_CONFIRMED)
        .bind(topics::ORDER_CANCELLED)
}

pub struct UsageHandler<S: DiscountStore> {
    tracker: Arc<DiscountTracker<S>>,
}

impl<S: DiscountStore> Clone for UsageHandler<S> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
        }
    }
}

impl<S: DiscountStore> UsageHandler<S> {
    pub fn new(tracker: Arc<DiscountTracker<S>>) -> Self {
        Self { tracker }
    }
}

pub fn register_handlers<S: DiscountStore>(
    registry: &mut HandlerRegistry,
    tracker: Arc<DiscountTracker<S>>,
) {
    let handler = UsageHandler::new(tracker);
    registry
        .register::<OrderConfirmed, _>(handler.clone())
        .register::<OrderCancelled, _>(handler);
}

fn handler_error(err: DiscountError) -> HandlerError {
    if err.is_transient() {
        HandlerError::transient(err)
    } else {
        HandlerError::rejected(err)
    }
}

#[async_trait]
impl<S: DiscountStore> EventHandler<OrderConfirmed> for UsageHandler<S> {
    async fn handle(&self, event: OrderConfirmed, ctx: &MessageContext) -> Result<(), HandlerError> {
        let Some(discount_id) = event.discount_id else {
            return Ok(());
        };

        let outcome = self
            .tracker
            .record_usage(RecordUsage {
                discount_id,
                user_id: event.user_id,
                order_id: event.order_id,
                order_amount: event.subtotal_amount,
                discount_amount: event.discount_amount,
            })
            .await
            .map_err(handler_error)?;

        // The order is paid and confirmed; losing the cap race is not a reason to undo it.
        if let RecordOutcome::UsageLimitExceeded(scope) = outcome {
            metrics::counter!("discount_usage_limit_races_total").increment(1);
            tracing::warn!(
                order_id = %event.order_id,
                %discount_id,
                ?scope,
                attempt = ctx.attempt,
                "usage cap reached after order confirmation, usage not recorded"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<S: DiscountStore> EventHandler<OrderCancelled> for UsageHandler<S> {
    async fn handle(&self, event: OrderCancelled, ctx: &MessageContext) -> Result<(), HandlerError> {
        if event.discount_id.is_none() {
            return Ok(());
        }
        let outcome = self
            .tracker
            .rollback_usage(event.order_id)
            .await
            .map_err(handler_error)?;
        tracing::debug!(order_id = %event.order_id, attempt = ctx.attempt, ?outcome, "handled OrderCancelled");
        Ok(())
    }
}
