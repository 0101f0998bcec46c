//! Bus consumers: inventory reacts to confirmed and cancelled orders.

use std::sync::Arc;

use async_trait::async_trait;
use domain::contracts::{OrderCancelled, OrderConfirmed, topics};
use event_bus::{EventHandler, HandlerError, HandlerRegistry, MessageContext, QueueSpec};

use crate::InventoryError;
use crate::engine::ReservationEngine;
use crate::ledger::StockLedger;
use crate::model::ReturnLine;

pub const QUEUE: &str = "inventory.order-events";

pub fn queue_spec() -> QueueSpec {
    QueueSpec::new(QUEUE)
        .bind(topics::ORDER_CONFIRMED)
        .bind(topics::ORDER_CANCELLED)
}

pub struct OrderEventsHandler<L: StockLedger> {
    engine: Arc<ReservationEngine<L>>,
}

impl<L: StockLedger> Clone for OrderEventsHandler<L> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<L: StockLedger> OrderEventsHandler<L> {
    pub fn new(engine: Arc<ReservationEngine<L>>) -> Self {
        Self { engine }
    }
}

pub fn register_handlers<L: StockLedger>(
    registry: &mut HandlerRegistry,
    engine: Arc<ReservationEngine<L>>,
) {
    let handler = OrderEventsHandler::new(engine);
    registry
        .register::<OrderConfirmed, _>(handler.clone())
        .register::<OrderCancelled, _>(handler);
}

fn handler_error(err: InventoryError) -> HandlerError {
    if err.is_transient() {
        HandlerError::transient(err)
    } else {
        HandlerError::rejected(err)
    }
}

#[async_trait]
impl<L: StockLedger> EventHandler<OrderConfirmed> for OrderEventsHandler<L> {
    async fn handle(&self, event: OrderConfirmed, ctx: &MessageContext) -> Result<(), HandlerError> {
        let outcome = self
            .engine
            .commit(event.order_id)
            .await
            .map_err(handler_error)?;

        // The orchestrator commits before confirming, so this is normally a no-op.
        tracing::debug!(
            order_id = %event.order_id,
            attempt = ctx.attempt,
            applied = outcome.is_applied(),
            "handled OrderConfirmed"
        );
        Ok(())
    }
}

#[async_trait]
impl<L: StockLedger> EventHandler<OrderCancelled> for OrderEventsHandler<L> {
    async fn handle(&self, event: OrderCancelled, ctx: &MessageContext) -> Result<(), HandlerError> {
        let order_id = event.order_id;
        let returns: Vec<ReturnLine> = event
            .items
            .iter()
            .filter(|item| item.stock_committed)
            .map(|item| ReturnLine {
                product_id: item.product_id.clone(),
                variant_id: item.variant_id.clone(),
                quantity: item.quantity,
            })
            .collect();

        if !returns.is_empty() {
            self.engine
                .return_stock(order_id, &returns, &event.reason)
                .await
                .map_err(handler_error)?;
        }
        if returns.len() < event.items.len() {
            self.engine
                .release(order_id, &event.reason)
                .await
                .map_err(handler_error)?;
        }

        tracing::debug!(%order_id, attempt = ctx.attempt, "handled OrderCancelled");
        Ok(())
    }
}
