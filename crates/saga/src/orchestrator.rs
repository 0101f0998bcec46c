//! Order orchestrator: drives an order from placement to a final status.
//!
//! The orchestrator is the only writer of order state. It calls inventory and
//! discount synchronously for the steps that decide the order's fate (reserve,
//! commit, record usage) and leaves the rest to the integration events written to
//! the outbox with every state change, which the owning services consume
//! idempotently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{RetryPolicy, UserId, retry_async};
use discount::{DiscountError, DiscountLine, RecordOutcome, RecordUsage};
use domain::{
    AppliedDiscount, CancellationPolicy, CommandMetadata, CommandResult, DomainError, Money,
    Order, OrderError, OrderId, OrderLine, OrderService, OrderStatus, PlaceOrder,
};
use event_store::{EventEnvelope, EventStore};
use inventory::{InventoryError, ReservationLine, ReservationStatus};
use tokio::sync::Notify;

use crate::payment::{PaymentError, PaymentGateway, PaymentRequest};
use crate::ports::{DiscountService, InventoryService};
use crate::{Result, SagaError};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Reservation TTL; `None` uses the inventory default.
    pub reservation_ttl: Option<chrono::Duration>,
    pub cancellation_policy: CancellationPolicy,
    /// Backoff for downstream calls that fail transiently.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: None,
            cancellation_policy: CancellationPolicy::default(),
            retry: RetryPolicy::exponential(3, Duration::from_millis(50), Duration::from_secs(1)),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_reservation_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.reservation_ttl = Some(ttl);
        self
    }

    pub fn with_cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation_policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct OrderOrchestrator<S, I, D, P>
where
    S: EventStore,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    orders: OrderService<S>,
    inventory: Arc<I>,
    discounts: Arc<D>,
    payments: Arc<P>,
    config: OrchestratorConfig,
    outbox_waker: Option<Arc<Notify>>,
}

fn correlated(order_id: OrderId, meta: &CommandMetadata) -> CommandMetadata {
    let mut meta = meta.clone();
    if meta.correlation_id.is_none() {
        meta.correlation_id = Some(order_id.to_string());
    }
    meta
}

fn record_step(step: &'static str, started: Instant) {
    metrics::histogram!("saga_step_duration_seconds", "step" => step)
        .record(started.elapsed().as_secs_f64());
}

/// The status an order moved to behind our back, when that is why a command failed.
fn overtaken_by(err: &DomainError) -> Option<OrderStatus> {
    match err {
        DomainError::Order(OrderError::InvalidStateTransition { from, .. })
            if matches!(from, OrderStatus::Cancelled | OrderStatus::PaymentFailed) =>
        {
            Some(*from)
        }
        _ => None,
    }
}

impl<S, I, D, P> OrderOrchestrator<S, I, D, P>
where
    S: EventStore,
    I: InventoryService,
    D: DiscountService,
    P: PaymentGateway,
{
    pub fn new(
        store: S,
        inventory: Arc<I>,
        discounts: Arc<D>,
        payments: Arc<P>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            orders: OrderService::new(store),
            inventory,
            discounts,
            payments,
            config,
            outbox_waker: None,
        }
    }

    /// Wakes the outbox relay whenever a command wrote integration messages.
    pub fn with_outbox_waker(mut self, waker: Arc<Notify>) -> Self {
        self.outbox_waker = Some(waker);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn orders(&self) -> &OrderService<S> {
        &self.orders
    }

    /// Places an order, reserves its stock and starts payment.
    ///
    /// An order whose stock cannot be reserved is returned Cancelled with the
    /// shortfall as its reason. A rejected discount code fails before anything is
    /// written.
    #[tracing::instrument(skip(self, lines, meta))]
    pub async fn place_order(
        &self,
        user_id: UserId,
        lines: Vec<OrderLine>,
        discount_code: Option<&str>,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        let started = Instant::now();

        let applied = match discount_code {
            Some(code) => Some(self.apply_discount(user_id, &lines, code).await?),
            None => None,
        };
        let mut cmd = PlaceOrder::new(user_id, lines);
        if let Some(discount) = applied {
            cmd = cmd.with_discount(discount);
        }
        let order_id = cmd.order_id;
        let meta = correlated(order_id, meta);

        let placed = self.orders.place_order(cmd, &meta).await?;
        metrics::counter!("saga_orders_placed_total").increment(1);
        tracing::info!(%order_id, order_number = placed.aggregate.order_number(), "order placed");
        let order = placed.aggregate;

        let reservation_lines: Vec<ReservationLine> =
            order.lines().iter().map(ReservationLine::from).collect();
        let reserve_started = Instant::now();
        let reserved = retry_async(
            &self.config.retry,
            "inventory.reserve",
            InventoryError::is_transient,
            || {
                self.inventory
                    .reserve(order_id, &reservation_lines, self.config.reservation_ttl)
            },
        )
        .await;
        record_step("reserve", reserve_started);

        let order = match reserved {
            Ok(receipt) => {
                let result = self
                    .orders
                    .record_reservation(order_id, receipt.reservation_ids(), receipt.expires_at, &meta)
                    .await?;
                self.announce(&result);
                result.aggregate
            }
            Err(err) => {
                let result = self
                    .orders
                    .reject_reservation(order_id, &format!("stock reservation failed: {err}"), &meta)
                    .await?;
                self.announce(&result);
                metrics::counter!("saga_orders_cancelled_total").increment(1);
                tracing::warn!(%order_id, error = %err, "reservation failed, order cancelled");
                if err.is_validation() {
                    return Ok(result.aggregate);
                }
                return Err(err.into());
            }
        };

        let request = PaymentRequest {
            order_id,
            order_number: order.order_number().to_string(),
            user_id,
            amount: order.total(),
        };
        let initiated = retry_async(
            &self.config.retry,
            "payment.initiate",
            PaymentError::is_transient,
            || self.payments.initiate(&request),
        )
        .await;

        let order = match initiated {
            Ok(intent) => {
                tracing::info!(%order_id, payment_id = %intent.payment_id, "payment initiated");
                order
            }
            Err(err) => {
                tracing::warn!(%order_id, error = %err, "payment could not be started");
                self.fail_payment(order_id, &err.to_string(), &meta).await?
            }
        };

        record_step("place_order", started);
        Ok(order)
    }

    async fn apply_discount(
        &self,
        user_id: UserId,
        lines: &[OrderLine],
        code: &str,
    ) -> Result<AppliedDiscount> {
        let subtotal: Money = lines.iter().map(OrderLine::total_price).sum();
        let items: Vec<DiscountLine> = lines.iter().map(DiscountLine::from).collect();

        let validation = retry_async(
            &self.config.retry,
            "discount.validate",
            DiscountError::is_transient,
            || self.discounts.validate(code, subtotal, &items, Some(user_id)),
        )
        .await?;

        match validation.discount {
            Some(discount) if validation.valid => Ok(AppliedDiscount {
                discount_id: discount.id,
                code: discount.code,
                amount: validation.discount_amount,
            }),
            _ => Err(SagaError::DiscountRejected(validation.message)),
        }
    }

    /// Payment went through: commit stock, record discount usage, confirm.
    #[tracing::instrument(skip(self, meta))]
    pub async fn handle_payment_success(
        &self,
        order_id: OrderId,
        transaction_id: &str,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        let started = Instant::now();
        let meta = correlated(order_id, meta);
        let order = self.load(order_id).await?;

        match order.status() {
            OrderStatus::PendingPayment => {}
            OrderStatus::Created => return Err(SagaError::PaymentNotExpected(order_id)),
            status if status.is_paid() => {
                if order.transaction_id() != Some(transaction_id) {
                    tracing::error!(
                        %order_id,
                        transaction_id,
                        existing = order.transaction_id(),
                        "second payment for an order that is already paid"
                    );
                }
                return Ok(order);
            }
            status => {
                tracing::warn!(%order_id, %status, "payment arrived for an order that will not be fulfilled");
                return self
                    .refund_late_payment(order_id, transaction_id, status, &meta)
                    .await;
            }
        }

        let committed = retry_async(
            &self.config.retry,
            "inventory.commit",
            InventoryError::is_transient,
            || self.inventory.commit(order_id),
        )
        .await?;
        if !committed.is_applied() && !self.stock_already_committed(order_id).await? {
            return self
                .fail_paid_order_without_stock(order_id, transaction_id, &meta)
                .await;
        }

        if let (Some(discount), Some(user_id)) = (order.discount(), order.user_id()) {
            let request = RecordUsage {
                discount_id: discount.discount_id,
                user_id,
                order_id,
                order_amount: order.subtotal(),
                discount_amount: discount.amount,
            };
            let outcome = retry_async(
                &self.config.retry,
                "discount.record_usage",
                DiscountError::is_transient,
                || self.discounts.record_usage(request.clone()),
            )
            .await?;
            // Paid orders stay confirmed even when another order took the last use.
            if let RecordOutcome::UsageLimitExceeded(scope) = outcome {
                metrics::counter!("discount_usage_limit_races_total").increment(1);
                tracing::warn!(%order_id, ?scope, "discount usage cap reached at confirmation");
            }
        }

        match self
            .orders
            .confirm_payment(order_id, transaction_id, &meta)
            .await
        {
            Ok(result) => {
                self.announce(&result);
                if result.changed() {
                    metrics::counter!("saga_orders_confirmed_total").increment(1);
                    tracing::info!(%order_id, transaction_id, "order confirmed");
                }
                record_step("confirm", started);
                Ok(result.aggregate)
            }
            Err(err) => match overtaken_by(&err) {
                Some(status) => {
                    self.undo_confirmation(order_id, &order, transaction_id, status, &meta)
                        .await
                }
                None => Err(err.into()),
            },
        }
    }

    /// Payment failed: free the stock and mark the order.
    #[tracing::instrument(skip(self, meta))]
    pub async fn handle_payment_failed(
        &self,
        order_id: OrderId,
        error_message: &str,
        failure_reason: &str,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        let meta = correlated(order_id, meta);
        let order = self.load(order_id).await?;

        match order.status() {
            OrderStatus::PendingPayment => {}
            OrderStatus::Created => return Err(SagaError::PaymentNotExpected(order_id)),
            OrderStatus::PaymentFailed | OrderStatus::Cancelled => return Ok(order),
            status => {
                tracing::warn!(%order_id, %status, "payment failure after confirmation, ignoring");
                return Ok(order);
            }
        }

        self.fail_payment(order_id, &format!("{error_message} ({failure_reason})"), &meta)
            .await
    }

    /// Cancels an order, then returns or releases its stock and rolls back its
    /// discount usage.
    ///
    /// The Cancelled transition is recorded first, so a shipment racing the
    /// cancellation either wins (and the cancel is refused) or is refused itself.
    /// Compensation that fails here is left to the `OrderCancelled` consumers.
    #[tracing::instrument(skip(self, meta))]
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        reason: &str,
        cancelled_by: Option<&str>,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        let meta = correlated(order_id, meta);
        let policy = self.config.cancellation_policy;
        let order = self.load(order_id).await?;
        if order.status() == OrderStatus::Cancelled {
            return Ok(order);
        }

        let result = self
            .orders
            .cancel(order_id, reason, cancelled_by, &policy, &meta)
            .await?;
        self.announce(&result);
        if !result.changed() {
            return Ok(result.aggregate);
        }
        metrics::counter!("saga_orders_cancelled_total").increment(1);
        tracing::info!(%order_id, reason, "order cancelled");

        let order = result.aggregate;
        if let Err(err) = self.compensate_cancellation(&order, order_id, reason).await {
            tracing::warn!(
                %order_id,
                error = %err,
                "compensation after cancel failed, leaving it to OrderCancelled consumers"
            );
        }
        Ok(order)
    }

    async fn compensate_cancellation(
        &self,
        order: &Order,
        order_id: OrderId,
        reason: &str,
    ) -> Result<()> {
        if order.stock_committed() {
            retry_async(
                &self.config.retry,
                "inventory.return",
                InventoryError::is_transient,
                || self.inventory.return_stock(order_id, &[], reason),
            )
            .await?;
        } else {
            retry_async(
                &self.config.retry,
                "inventory.release",
                InventoryError::is_transient,
                || self.inventory.release(order_id, reason),
            )
            .await?;
        }
        if order.discount().is_some() {
            self.rollback_discount(order_id).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn ship_order(
        &self,
        order_id: OrderId,
        tracking_number: Option<&str>,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        let result = self
            .orders
            .ship(order_id, tracking_number, &correlated(order_id, meta))
            .await?;
        self.announce(&result);
        Ok(result.aggregate)
    }

    #[tracing::instrument(skip(self, meta))]
    pub async fn deliver_order(&self, order_id: OrderId, meta: &CommandMetadata) -> Result<Order> {
        let result = self
            .orders
            .deliver(order_id, &correlated(order_id, meta))
            .await?;
        self.announce(&result);
        Ok(result.aggregate)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.get_order(order_id).await?)
    }

    pub async fn order_history(&self, order_id: OrderId) -> Result<Vec<EventEnvelope>> {
        let history = self.orders.history(order_id).await?;
        if history.is_empty() {
            return Err(SagaError::OrderNotFound(order_id));
        }
        Ok(history)
    }

    async fn load(&self, order_id: OrderId) -> Result<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))
    }

    async fn fail_payment(
        &self,
        order_id: OrderId,
        reason: &str,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        retry_async(
            &self.config.retry,
            "inventory.release",
            InventoryError::is_transient,
            || self.inventory.release(order_id, "payment failed"),
        )
        .await?;

        let result = self.orders.fail_payment(order_id, reason, None, meta).await?;
        self.announce(&result);
        if result.changed() {
            metrics::counter!("saga_payment_failures_total").increment(1);
            tracing::info!(%order_id, reason, "payment failed, stock released");
        }
        Ok(result.aggregate)
    }

    /// Money was taken but the reservation is gone (typically expired), so the
    /// order cannot be fulfilled.
    async fn fail_paid_order_without_stock(
        &self,
        order_id: OrderId,
        transaction_id: &str,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        metrics::counter!("saga_fatal_inconsistencies_total").increment(1);
        tracing::error!(
            %order_id,
            transaction_id,
            "payment captured but no stock reservation left, failing order and refunding"
        );

        match self
            .orders
            .fail_payment(
                order_id,
                "stock reservation expired before payment",
                Some(transaction_id),
                meta,
            )
            .await
        {
            Ok(result) => {
                self.announce(&result);
                metrics::counter!("saga_payment_failures_total").increment(1);
                Ok(result.aggregate)
            }
            Err(err) => match overtaken_by(&err) {
                Some(status) => {
                    self.refund_late_payment(order_id, transaction_id, status, meta)
                        .await
                }
                None => Err(err.into()),
            },
        }
    }

    /// The order was cancelled while its payment was being confirmed: the stock we
    /// just committed goes back and the payment is refunded.
    async fn undo_confirmation(
        &self,
        order_id: OrderId,
        order: &Order,
        transaction_id: &str,
        status: OrderStatus,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        tracing::warn!(%order_id, %status, "order left PendingPayment while confirming, undoing commit");

        let reason = format!("order {status} before payment was confirmed");
        retry_async(
            &self.config.retry,
            "inventory.return",
            InventoryError::is_transient,
            || self.inventory.return_stock(order_id, &[], &reason),
        )
        .await?;
        if order.discount().is_some() {
            self.rollback_discount(order_id).await?;
        }

        self.refund_late_payment(order_id, transaction_id, status, meta)
            .await
    }

    async fn refund_late_payment(
        &self,
        order_id: OrderId,
        transaction_id: &str,
        status: OrderStatus,
        meta: &CommandMetadata,
    ) -> Result<Order> {
        let result = self
            .orders
            .request_refund(
                order_id,
                transaction_id,
                &format!("payment received for {status} order"),
                meta,
            )
            .await?;
        self.announce(&result);
        if result.changed() {
            tracing::info!(%order_id, transaction_id, "refund requested");
        }
        Ok(result.aggregate)
    }

    async fn rollback_discount(&self, order_id: OrderId) -> Result<()> {
        retry_async(
            &self.config.retry,
            "discount.rollback_usage",
            DiscountError::is_transient,
            || self.discounts.rollback_usage(order_id),
        )
        .await?;
        Ok(())
    }

    /// A redelivered PaymentSuccess finds nothing Pending because the first delivery
    /// already committed.
    async fn stock_already_committed(&self, order_id: OrderId) -> Result<bool> {
        let reservations = retry_async(
            &self.config.retry,
            "inventory.reservations",
            InventoryError::is_transient,
            || self.inventory.reservations(order_id),
        )
        .await?;
        Ok(reservations
            .iter()
            .any(|r| r.status == ReservationStatus::Committed))
    }

    fn announce(&self, result: &CommandResult<Order>) {
        if result.outbox_messages > 0
            && let Some(waker) = &self.outbox_waker
        {
            waker.notify_one();
        }
    }
}
