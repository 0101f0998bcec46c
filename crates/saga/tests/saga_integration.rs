//! End-to-end tests for the order-fulfillment saga.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use common::{RetryPolicy, UserId};
use discount::{
    DiscountKind, DiscountTracker, InMemoryDiscountStore, NewDiscount, UsageStatus,
};
use domain::contracts::OrderCancellationRequested;
use domain::{
    Aggregate, CancellationPolicy, CommandMetadata, Money, Order, OrderError, OrderId, OrderLine,
    OrderService, OrderStatus, PaymentStatus,
};
use event_bus::{
    Broker, Connection, Consumer, ConsumerConfig, HandlerRegistry, InMemoryBroker,
    InMemoryConnector, Message,
};
use event_store::{EventStore, InMemoryEventStore};
use inventory::{
    EngineConfig, InMemoryLedger, InventoryError, OperationOutcome, ReservationEngine,
    ReservationLine, ReservationReceipt, ReservationStatus, ReturnLine, StockKey,
    StockReservation,
};
use saga::{
    InMemoryPaymentGateway, InventoryService, OrchestratorConfig, OrderOrchestrator, OutboxRelay,
    PaymentCallback, PaymentOutcomeAdapter, SagaError, handlers,
};
use tokio::sync::Mutex;

type Orchestrator = OrderOrchestrator<
    InMemoryEventStore,
    ReservationEngine<InMemoryLedger>,
    DiscountTracker<InMemoryDiscountStore>,
    InMemoryPaymentGateway,
>;

struct TestHarness {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<ReservationEngine<InMemoryLedger>>,
    discounts: Arc<DiscountTracker<InMemoryDiscountStore>>,
    gateway: Arc<InMemoryPaymentGateway>,
    store: InMemoryEventStore,
    meta: CommandMetadata,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_config(OrchestratorConfig::default()).await
    }

    async fn with_config(config: OrchestratorConfig) -> Self {
        let store = InMemoryEventStore::new();
        let engine = Arc::new(ReservationEngine::new(
            InMemoryLedger::new(),
            EngineConfig::default(),
        ));
        engine
            .receive_stock(StockKey::new("SKU-1", "WH-1"), 10, "initial stock")
            .await
            .unwrap();
        engine
            .receive_stock(StockKey::new("SKU-2", "WH-1"), 5, "initial stock")
            .await
            .unwrap();
        let discounts = Arc::new(DiscountTracker::new(InMemoryDiscountStore::new()));
        let gateway = Arc::new(InMemoryPaymentGateway::new());

        let orchestrator = Arc::new(OrderOrchestrator::new(
            store.clone(),
            engine.clone(),
            discounts.clone(),
            gateway.clone(),
            config.with_retry(RetryPolicy::no_retry()),
        ));

        Self {
            orchestrator,
            engine,
            discounts,
            gateway,
            store,
            meta: CommandMetadata::default(),
        }
    }

    async fn create_discount(&self, code: &str, percent: u32) -> common::DiscountId {
        self.discounts
            .create_discount(NewDiscount::new(code, code, DiscountKind::Percentage { percent }))
            .await
            .unwrap()
            .id
    }

    fn lines() -> Vec<OrderLine> {
        vec![
            OrderLine::new("SKU-1", "Widget", 2, Money::from_cents(1_000)),
            OrderLine::new("SKU-2", "Gadget", 1, Money::from_cents(2_500)),
        ]
    }

    async fn place(&self, discount_code: Option<&str>) -> Order {
        self.orchestrator
            .place_order(UserId::new(), Self::lines(), discount_code, &self.meta)
            .await
            .unwrap()
    }

    async fn pay(&self, order_id: OrderId, transaction_id: &str) -> Order {
        self.orchestrator
            .handle_payment_success(order_id, transaction_id, &self.meta)
            .await
            .unwrap()
    }

    async fn cancel(&self, order_id: OrderId) -> Result<Order, SagaError> {
        self.orchestrator
            .cancel_order(order_id, "customer request", Some("customer"), &self.meta)
            .await
    }

    /// (on hand, reserved) for a product in WH-1.
    async fn stock(&self, product: &str) -> (i64, i64) {
        let item = self
            .engine
            .stock_level(&StockKey::new(product, "WH-1"))
            .await
            .unwrap()
            .unwrap();
        (item.quantity, item.reserved_quantity)
    }

    async fn pending_message_types(&self) -> Vec<String> {
        self.store
            .pending_outbox(100)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message_type)
            .collect()
    }
}

fn id_of(order: &Order) -> OrderId {
    order.id().unwrap()
}

#[tokio::test]
async fn test_happy_path_reserves_pays_and_confirms() {
    let h = TestHarness::new().await;

    let order = h.place(None).await;
    let order_id = id_of(&order);
    assert_eq!(order.status(), OrderStatus::PendingPayment);
    assert_eq!(order.reservation_ids().len(), 2);
    assert_eq!(order.total(), Money::from_cents(4_500));
    assert_eq!(h.stock("SKU-1").await, (10, 2));

    let initiated = h.gateway.initiated().await;
    assert_eq!(initiated.len(), 1);
    assert_eq!(initiated[0].amount, Money::from_cents(4_500));

    let order = h.pay(order_id, "txn-1").await;
    assert_eq!(order.status(), OrderStatus::Confirmed);
    assert_eq!(order.payment_status(), PaymentStatus::Paid);
    assert!(order.stock_committed());
    assert_eq!(h.stock("SKU-1").await, (8, 0));
    assert_eq!(h.stock("SKU-2").await, (4, 0));
    assert_eq!(h.pending_message_types().await, vec!["OrderConfirmed"]);
}

#[tokio::test]
async fn test_insufficient_stock_cancels_without_holding_anything() {
    let h = TestHarness::new().await;

    let order = h
        .orchestrator
        .place_order(
            UserId::new(),
            vec![
                OrderLine::new("SKU-1", "Widget", 2, Money::from_cents(1_000)),
                OrderLine::new("SKU-2", "Gadget", 6, Money::from_cents(2_500)),
            ],
            None,
            &h.meta,
        )
        .await
        .unwrap();

    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert!(order.status_reason().unwrap().contains("SKU-2"));
    assert_eq!(h.stock("SKU-1").await, (10, 0));
    assert_eq!(h.stock("SKU-2").await, (5, 0));
    assert!(h.gateway.initiated().await.is_empty());
    assert_eq!(h.pending_message_types().await, vec!["OrderCancelled"]);
}

#[tokio::test]
async fn test_discount_is_applied_and_recorded_on_confirmation() {
    let h = TestHarness::new().await;
    let discount_id = h.create_discount("SAVE10", 10).await;

    let order = h.place(Some("save10")).await;
    let order_id = id_of(&order);
    assert_eq!(order.discount_amount(), Money::from_cents(450));
    assert_eq!(order.total(), Money::from_cents(4_050));
    assert!(h.discounts.usage_for_order(order_id).await.unwrap().is_none());

    h.pay(order_id, "txn-1").await;

    let usage = h.discounts.usage_for_order(order_id).await.unwrap().unwrap();
    assert_eq!(usage.status, UsageStatus::Active);
    assert_eq!(usage.discount_amount, Money::from_cents(450));
    assert_eq!(h.discounts.usage_stats(discount_id).await.unwrap().times_used, 1);
}

#[tokio::test]
async fn test_rejected_discount_code_writes_nothing() {
    let h = TestHarness::new().await;

    let err = h
        .orchestrator
        .place_order(UserId::new(), TestHarness::lines(), Some("NOPE"), &h.meta)
        .await
        .unwrap_err();

    assert!(matches!(err, SagaError::DiscountRejected(_)));
    assert!(err.is_validation());
    assert_eq!(h.stock("SKU-1").await, (10, 0));
    assert!(h.gateway.initiated().await.is_empty());
    assert!(h.pending_message_types().await.is_empty());
}

#[tokio::test]
async fn test_cancel_before_payment_releases_reservations() {
    let h = TestHarness::new().await;
    h.create_discount("SAVE10", 10).await;
    let order_id = id_of(&h.place(Some("SAVE10")).await);

    let order = h.cancel(order_id).await.unwrap();

    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(h.stock("SKU-1").await, (10, 0));
    assert!(
        h.engine
            .reservations(order_id)
            .await
            .unwrap()
            .iter()
            .all(|r| r.status == ReservationStatus::Released)
    );
    // Nothing was recorded before payment, so there is nothing to roll back.
    assert!(h.discounts.usage_for_order(order_id).await.unwrap().is_none());
    assert!(h.gateway.refunds().await.is_empty());
}

#[tokio::test]
async fn test_cancel_after_payment_returns_stock_rolls_back_and_refunds() {
    let h = TestHarness::new().await;
    let discount_id = h.create_discount("SAVE10", 10).await;
    let order_id = id_of(&h.place(Some("SAVE10")).await);
    h.pay(order_id, "txn-1").await;
    assert_eq!(h.stock("SKU-1").await, (8, 0));

    let order = h.cancel(order_id).await.unwrap();

    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(order.payment_status(), PaymentStatus::RefundRequested);
    assert_eq!(h.stock("SKU-1").await, (10, 0));
    assert_eq!(h.stock("SKU-2").await, (5, 0));
    let usage = h.discounts.usage_for_order(order_id).await.unwrap().unwrap();
    assert_eq!(usage.status, UsageStatus::RolledBack);
    assert_eq!(h.discounts.usage_stats(discount_id).await.unwrap().times_used, 0);
    assert_eq!(
        h.pending_message_types().await,
        vec!["OrderConfirmed", "OrderCancelled", "RefundRequested"]
    );

    // Cancelling again changes nothing.
    h.cancel(order_id).await.unwrap();
    assert_eq!(h.orchestrator.order_history(order_id).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_payment_failure_releases_stock() {
    let h = TestHarness::new().await;
    let order_id = id_of(&h.place(None).await);

    let order = h
        .orchestrator
        .handle_payment_failed(order_id, "Card declined", "card_declined", &h.meta)
        .await
        .unwrap();

    assert_eq!(order.status(), OrderStatus::PaymentFailed);
    assert!(order.status_reason().unwrap().contains("card_declined"));
    assert_eq!(h.stock("SKU-1").await, (10, 0));

    // A late success for the same order is refunded, not confirmed.
    let order = h.pay(order_id, "txn-late").await;
    assert_eq!(order.status(), OrderStatus::PaymentFailed);
    assert_eq!(order.payment_status(), PaymentStatus::RefundRequested);
}

#[tokio::test]
async fn test_declined_payment_request_fails_the_order() {
    let h = TestHarness::new().await;
    h.gateway.set_decline(true).await;

    let order = h.place(None).await;

    assert_eq!(order.status(), OrderStatus::PaymentFailed);
    assert_eq!(h.stock("SKU-1").await, (10, 0));
}

#[tokio::test]
async fn test_gateway_outage_is_retried_at_placement() {
    let h = TestHarness::new().await;
    let orchestrator = OrderOrchestrator::new(
        h.store.clone(),
        h.engine.clone(),
        h.discounts.clone(),
        h.gateway.clone(),
        OrchestratorConfig::default().with_retry(RetryPolicy::immediate(3)),
    );
    h.gateway.set_unavailable_for(2).await;

    let order = orchestrator
        .place_order(UserId::new(), TestHarness::lines(), None, &h.meta)
        .await
        .unwrap();

    assert_eq!(order.status(), OrderStatus::PendingPayment);
    assert_eq!(h.gateway.initiated().await.len(), 1);
}

#[tokio::test]
async fn test_payment_after_reservation_expired_fails_and_refunds() {
    let h = TestHarness::with_config(
        OrchestratorConfig::default().with_reservation_ttl(Duration::seconds(-1)),
    )
    .await;
    let order_id = id_of(&h.place(None).await);
    assert_eq!(h.engine.expire_due().await.unwrap().len(), 2);

    let order = h.pay(order_id, "txn-1").await;

    assert_eq!(order.status(), OrderStatus::PaymentFailed);
    assert_eq!(order.payment_status(), PaymentStatus::RefundRequested);
    assert!(!order.stock_committed());
    assert_eq!(h.stock("SKU-1").await, (10, 0));
    assert!(
        h.pending_message_types()
            .await
            .contains(&"RefundRequested".to_string())
    );
}

#[tokio::test]
async fn test_duplicate_payment_success_is_idempotent() {
    let h = TestHarness::new().await;
    let order_id = id_of(&h.place(None).await);

    h.pay(order_id, "txn-1").await;
    let versions = h.orchestrator.order_history(order_id).await.unwrap().len();
    let order = h.pay(order_id, "txn-1").await;

    assert_eq!(order.status(), OrderStatus::Confirmed);
    assert_eq!(h.orchestrator.order_history(order_id).await.unwrap().len(), versions);
    assert_eq!(h.stock("SKU-1").await, (8, 0));
    assert_eq!(h.pending_message_types().await, vec!["OrderConfirmed"]);
}

#[tokio::test]
async fn test_late_payment_after_cancellation_is_refunded() {
    let h = TestHarness::new().await;
    let order_id = id_of(&h.place(None).await);
    h.cancel(order_id).await.unwrap();

    let order = h.pay(order_id, "txn-1").await;

    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(order.payment_status(), PaymentStatus::RefundRequested);
    assert_eq!(h.stock("SKU-1").await, (10, 0));
}

#[tokio::test]
async fn test_each_late_payment_is_refunded_once() {
    let h = TestHarness::new().await;
    let order_id = id_of(&h.place(None).await);
    h.cancel(order_id).await.unwrap();

    h.pay(order_id, "txn-1").await;
    h.pay(order_id, "txn-2").await;
    h.pay(order_id, "txn-1").await;

    let order = h.orchestrator.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.transaction_id(), Some("txn-2"));
    assert_eq!(
        h.pending_message_types().await,
        vec!["OrderCancelled", "RefundRequested", "RefundRequested"]
    );
}

#[tokio::test]
async fn test_cancellation_after_shipment_is_refused() {
    let h = TestHarness::with_config(
        OrchestratorConfig::default().with_cancellation_policy(CancellationPolicy::default()),
    )
    .await;
    let order_id = id_of(&h.place(None).await);
    h.pay(order_id, "txn-1").await;
    h.orchestrator
        .ship_order(order_id, Some("TRACK-1"), &h.meta)
        .await
        .unwrap();

    let err = h.cancel(order_id).await.unwrap_err();

    assert!(matches!(
        err.order_error(),
        Some(OrderError::CancellationNotAllowed { .. })
    ));
    // The refused cancellation must not have touched stock.
    assert_eq!(h.stock("SKU-1").await, (8, 0));

    let order = h.orchestrator.deliver_order(order_id, &h.meta).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Delivered);
}

/// Inventory that tries to ship the order while its stock is being returned.
struct ShipsDuringReturn {
    engine: Arc<ReservationEngine<InMemoryLedger>>,
    orders: OrderService<InMemoryEventStore>,
    shipped: Mutex<Option<bool>>,
}

#[async_trait]
impl InventoryService for ShipsDuringReturn {
    async fn reserve(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        ttl: Option<Duration>,
    ) -> Result<ReservationReceipt, InventoryError> {
        self.engine.reserve(order_id, lines, ttl).await
    }

    async fn commit(&self, order_id: OrderId) -> Result<OperationOutcome, InventoryError> {
        self.engine.commit(order_id).await
    }

    async fn release(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> Result<OperationOutcome, InventoryError> {
        self.engine.release(order_id, reason).await
    }

    async fn return_stock(
        &self,
        order_id: OrderId,
        lines: &[ReturnLine],
        reason: &str,
    ) -> Result<OperationOutcome, InventoryError> {
        let shipped = self
            .orders
            .ship(order_id, Some("TRACK-RACE"), &CommandMetadata::default())
            .await
            .is_ok();
        *self.shipped.lock().await = Some(shipped);
        self.engine.return_stock(order_id, lines, reason).await
    }

    async fn reservations(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<StockReservation>, InventoryError> {
        self.engine.reservations(order_id).await
    }
}

#[tokio::test]
async fn test_shipment_during_cancellation_is_refused() {
    let h = TestHarness::new().await;
    let inventory = Arc::new(ShipsDuringReturn {
        engine: h.engine.clone(),
        orders: OrderService::new(h.store.clone()),
        shipped: Mutex::new(None),
    });
    let orchestrator = OrderOrchestrator::new(
        h.store.clone(),
        inventory.clone(),
        h.discounts.clone(),
        h.gateway.clone(),
        OrchestratorConfig::default().with_retry(RetryPolicy::no_retry()),
    );
    let order_id = id_of(
        &orchestrator
            .place_order(UserId::new(), TestHarness::lines(), None, &h.meta)
            .await
            .unwrap(),
    );
    orchestrator
        .handle_payment_success(order_id, "txn-1", &h.meta)
        .await
        .unwrap();

    let order = orchestrator
        .cancel_order(order_id, "customer request", Some("customer"), &h.meta)
        .await
        .unwrap();

    assert_eq!(*inventory.shipped.lock().await, Some(false));
    assert_eq!(order.status(), OrderStatus::Cancelled);
    let stored = orchestrator.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), OrderStatus::Cancelled);
    assert_eq!(h.stock("SKU-1").await, (10, 0));
    assert!(
        orchestrator
            .order_history(order_id)
            .await
            .unwrap()
            .iter()
            .all(|e| e.event_type != "OrderShipped")
    );
}

#[tokio::test]
async fn test_unknown_order_is_not_found() {
    let h = TestHarness::new().await;

    let err = h
        .orchestrator
        .handle_payment_success(OrderId::new(), "txn-1", &h.meta)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(h.orchestrator.order_history(OrderId::new()).await.unwrap_err().is_not_found());
}

/// Every service wired over the in-memory bus.
struct BusHarness {
    h: TestHarness,
    broker: InMemoryBroker,
    connection: Arc<Connection<InMemoryConnector>>,
    relay: OutboxRelay<InMemoryEventStore, InMemoryConnector>,
    orders: Consumer<InMemoryConnector>,
    inventory: Consumer<InMemoryConnector>,
    discounts: Consumer<InMemoryConnector>,
    refunds: Consumer<InMemoryConnector>,
}

impl BusHarness {
    async fn new() -> Self {
        let h = TestHarness::new().await;
        let broker = InMemoryBroker::new();
        let connection = Arc::new(Connection::new(
            InMemoryConnector::new(broker.clone()),
            RetryPolicy::no_retry(),
        ));
        for spec in [
            handlers::queue_spec(),
            handlers::refund_queue_spec(),
            inventory::handlers::queue_spec(),
            discount::handlers::queue_spec(),
        ] {
            connection.declare_queue(spec).await.unwrap();
        }

        let consumer = |queue: &str, registry: HandlerRegistry| {
            Consumer::new(
                connection.clone(),
                Arc::new(registry),
                ConsumerConfig::new(queue)
                    .with_max_attempts(3)
                    .with_redelivery(RetryPolicy::immediate(3)),
            )
        };

        let mut registry = HandlerRegistry::new();
        handlers::register_handlers(&mut registry, h.orchestrator.clone());
        let orders = consumer(handlers::QUEUE, registry);

        let mut registry = HandlerRegistry::new();
        handlers::register_refund_handler(&mut registry, h.gateway.clone());
        let refunds = consumer(handlers::REFUND_QUEUE, registry);

        let mut registry = HandlerRegistry::new();
        inventory::handlers::register_handlers(&mut registry, h.engine.clone());
        let inventory = consumer(inventory::handlers::QUEUE, registry);

        let mut registry = HandlerRegistry::new();
        discount::handlers::register_handlers(&mut registry, h.discounts.clone());
        let discounts = consumer(discount::handlers::QUEUE, registry);

        let relay = OutboxRelay::new(h.store.clone(), connection.clone());

        Self {
            h,
            broker,
            connection,
            relay,
            orders,
            inventory,
            discounts,
            refunds,
        }
    }

    /// Relays and consumes until every queue is empty.
    async fn settle(&self) {
        loop {
            let relayed = self.relay.dispatch_pending().await.unwrap();
            let mut handled = 0;
            for consumer in [&self.orders, &self.inventory, &self.discounts, &self.refunds] {
                let summary = consumer.drain().await.unwrap();
                handled += summary.acked + summary.dead_lettered;
            }
            if relayed == 0 && handled == 0 {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_full_flow_over_the_bus() {
    let bus = BusHarness::new().await;
    let discount_id = bus.h.create_discount("SAVE10", 10).await;
    let order_id = id_of(&bus.h.place(Some("SAVE10")).await);
    let adapter = PaymentOutcomeAdapter::new(bus.connection.clone());

    adapter
        .publish(&PaymentCallback::succeeded(order_id, "txn-1"))
        .await
        .unwrap();
    // The provider retries its callback.
    adapter
        .publish(&PaymentCallback::succeeded(order_id, "txn-1"))
        .await
        .unwrap();
    bus.settle().await;

    let order = bus.h.orchestrator.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status(), OrderStatus::Confirmed);
    assert_eq!(bus.h.stock("SKU-1").await, (8, 0));
    assert_eq!(
        bus.h.discounts.usage_stats(discount_id).await.unwrap().times_used,
        1
    );
    assert!(bus.h.pending_message_types().await.is_empty());

    bus.connection
        .publish(
            Message::from_event(&OrderCancellationRequested {
                order_id,
                reason: "changed my mind".into(),
                requested_by: Some("customer".into()),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    bus.settle().await;

    let order = bus.h.orchestrator.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status(), OrderStatus::Cancelled);
    // Returned once by the orchestrator; the inventory consumer finds nothing left.
    assert_eq!(bus.h.stock("SKU-1").await, (10, 0));
    assert_eq!(bus.h.stock("SKU-2").await, (5, 0));
    let refunds = bus.h.gateway.refunds().await;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].transaction_id, "txn-1");
    assert_eq!(refunds[0].amount, Money::from_cents(4_050));
    assert_eq!(
        bus.h.discounts.usage_stats(discount_id).await.unwrap().times_used,
        0
    );
}

#[tokio::test]
async fn test_payment_failure_over_the_bus_releases_stock() {
    let bus = BusHarness::new().await;
    let order_id = id_of(&bus.h.place(None).await);
    let adapter = PaymentOutcomeAdapter::new(bus.connection.clone());

    adapter
        .publish(&PaymentCallback::failed(order_id, "Card declined", "card_declined"))
        .await
        .unwrap();
    bus.settle().await;

    let order = bus.h.orchestrator.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status(), OrderStatus::PaymentFailed);
    assert_eq!(bus.h.stock("SKU-1").await, (10, 0));
    assert!(bus.h.gateway.refunds().await.is_empty());
}

#[tokio::test]
async fn test_refund_outage_is_redelivered() {
    let bus = BusHarness::new().await;
    let order_id = id_of(&bus.h.place(None).await);
    bus.h.pay(order_id, "txn-1").await;
    bus.h.cancel(order_id).await.unwrap();
    bus.h.gateway.set_unavailable_for(1).await;

    bus.relay.dispatch_pending().await.unwrap();
    let summary = bus.refunds.drain().await.unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.acked, 1);
    assert_eq!(bus.h.gateway.refunds().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_message_type_is_dead_lettered() {
    let bus = BusHarness::new().await;
    let message = Message::builder()
        .message_type("PaymentAuthorized")
        .topic("payment.succeeded")
        .payload(&serde_json::json!({ "orderId": OrderId::new() }))
        .unwrap()
        .build()
        .unwrap();
    bus.connection.publish(message).await.unwrap();

    let summary = bus.orders.drain().await.unwrap();

    assert_eq!(summary.dead_lettered, 1);
    let dead = bus.broker.dead_letters(handlers::QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.message_type, "PaymentAuthorized");
}
