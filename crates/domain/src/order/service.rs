//! Order service: the only writer of order state.

use chrono::{DateTime, Utc};
use common::ReservationId;
use event_store::{EventEnvelope, EventStore};

use crate::aggregate::Aggregate;
use crate::command::{CommandHandler, CommandMetadata, CommandResult};
use crate::error::DomainError;
use crate::values::OrderId;

use super::{CancellationPolicy, Order, OrderError, PlaceOrder};

/// Reloads and re-runs a command this many times when another writer got in first.
const CONFLICT_RETRIES: u32 = 3;

pub struct OrderService<S: EventStore> {
    handler: CommandHandler<S, Order>,
}

impl<S: EventStore> OrderService<S> {
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    #[tracing::instrument(skip(self, cmd, meta), fields(order_id = %cmd.order_id))]
    pub async fn place_order(
        &self,
        cmd: PlaceOrder,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        let order_id = cmd.order_id;
        self.handler
            .execute(order_id, meta, |order| order.place(cmd))
            .await
    }

    #[tracing::instrument(skip(self, reservation_ids, meta))]
    pub async fn record_reservation(
        &self,
        order_id: OrderId,
        reservation_ids: Vec<ReservationId>,
        expires_at: DateTime<Utc>,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| {
            order.record_reservation(reservation_ids.clone(), expires_at)
        })
        .await
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn reject_reservation(
        &self,
        order_id: OrderId,
        reason: &str,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| order.reject_reservation(reason))
            .await
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn confirm_payment(
        &self,
        order_id: OrderId,
        transaction_id: &str,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| order.confirm_payment(transaction_id))
            .await
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn fail_payment(
        &self,
        order_id: OrderId,
        reason: &str,
        transaction_id: Option<&str>,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| {
            order.fail_payment(reason, transaction_id.map(str::to_string))
        })
        .await
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn request_refund(
        &self,
        order_id: OrderId,
        transaction_id: &str,
        reason: &str,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| {
            order.request_refund(transaction_id, reason)
        })
        .await
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn cancel(
        &self,
        order_id: OrderId,
        reason: &str,
        cancelled_by: Option<&str>,
        policy: &CancellationPolicy,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| {
            order.cancel(reason, cancelled_by.map(str::to_string), policy)
        })
        .await
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn ship(
        &self,
        order_id: OrderId,
        tracking_number: Option<&str>,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| {
            order.ship(tracking_number.map(str::to_string))
        })
        .await
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn deliver(
        &self,
        order_id: OrderId,
        meta: &CommandMetadata,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(order_id, meta, |order| order.deliver()).await
    }

    /// Returns None if the order doesn't exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, DomainError> {
        self.handler.load_existing(order_id).await
    }

    /// The order's stored events, oldest first.
    pub async fn history(&self, order_id: OrderId) -> Result<Vec<EventEnvelope>, DomainError> {
        Ok(self
            .handler
            .store()
            .get_events_for_aggregate(order_id)
            .await?)
    }

    async fn run<F>(
        &self,
        order_id: OrderId,
        meta: &CommandMetadata,
        command_fn: F,
    ) -> Result<CommandResult<Order>, DomainError>
    where
        F: Fn(&Order) -> Result<Vec<<Order as Aggregate>::Event>, OrderError>,
    {
        let result = self
            .handler
            .execute_with_retry(order_id, meta, CONFLICT_RETRIES, command_fn)
            .await;

        match result {
            Err(DomainError::Order(OrderError::NotPlaced)) => Err(DomainError::AggregateNotFound {
                aggregate_type: "Order",
                aggregate_id: order_id.to_string(),
            }),
            Ok(result) => {
                if let Some(event) = result.events.first() {
                    tracing::info!(
                        %order_id,
                        event = crate::aggregate::DomainEvent::event_type(event),
                        status = %result.aggregate.status(),
                        "order updated"
                    );
                }
                Ok(result)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::UserId;
    use event_store::InMemoryEventStore;

    use super::*;
    use crate::order::OrderStatus;
    use crate::values::{Money, OrderLine};

    fn place_cmd() -> PlaceOrder {
        PlaceOrder::new(
            UserId::new(),
            vec![OrderLine::new("SKU-001", "Widget", 6, Money::from_cents(1000))],
        )
    }

    async fn pending_order(service: &OrderService<InMemoryEventStore>) -> OrderId {
        let meta = CommandMetadata::default();
        let cmd = place_cmd();
        let order_id = cmd.order_id;
        service.place_order(cmd, &meta).await.unwrap();
        service
            .record_reservation(order_id, vec![ReservationId::new()], Utc::now(), &meta)
            .await
            .unwrap();
        order_id
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let store = InMemoryEventStore::new();
        let service = OrderService::new(store.clone());
        let meta = CommandMetadata::default();
        let order_id = pending_order(&service).await;

        service.confirm_payment(order_id, "txn-1", &meta).await.unwrap();
        service.ship(order_id, Some("TRACK-1"), &meta).await.unwrap();
        let result = service.deliver(order_id, &meta).await.unwrap();

        assert_eq!(result.aggregate.status(), OrderStatus::Delivered);
        assert_eq!(result.aggregate.tracking_number(), Some("TRACK-1"));

        let history = service.history(order_id).await.unwrap();
        let types: Vec<_> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "OrderPlaced",
                "StockReserved",
                "PaymentConfirmed",
                "OrderShipped",
                "OrderDelivered"
            ]
        );
        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let service = OrderService::new(InMemoryEventStore::new());
        let result = service
            .confirm_payment(OrderId::new(), "txn", &CommandMetadata::default())
            .await;

        assert!(matches!(result, Err(ref e) if e.is_not_found()));
        assert!(service.get_order(OrderId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_confirmation_is_idempotent() {
        let store = InMemoryEventStore::new();
        let service = OrderService::new(store.clone());
        let meta = CommandMetadata::caused_by("msg-1");
        let order_id = pending_order(&service).await;

        let first = service.confirm_payment(order_id, "txn-1", &meta).await.unwrap();
        let second = service.confirm_payment(order_id, "txn-1", &meta).await.unwrap();

        assert!(first.changed());
        assert!(!second.changed());
        assert_eq!(store.outbox_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn racing_confirm_and_cancel_settle_on_one_status() {
        let store = InMemoryEventStore::new();
        let service = std::sync::Arc::new(OrderService::new(store.clone()));
        let order_id = pending_order(&service).await;

        let confirm = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .confirm_payment(order_id, "txn-1", &CommandMetadata::default())
                    .await
            })
        };
        let cancel = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .cancel(
                        order_id,
                        "user request",
                        Some("user"),
                        &CancellationPolicy::default(),
                        &CommandMetadata::default(),
                    )
                    .await
            })
        };
        let confirm = confirm.await.unwrap();
        let cancel = cancel.await.unwrap();

        // The default policy allows cancelling after confirmation, so cancel always wins
        // in the end. Confirm either landed first or was rejected.
        assert!(cancel.is_ok());
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        if confirm.is_ok() {
            assert_eq!(order.payment_status(), crate::order::PaymentStatus::RefundRequested);
        }
    }
}
