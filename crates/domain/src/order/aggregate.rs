//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::{ReservationId, UserId};
use event_store::{OutboxMessage, Version};
use serde::Serialize;

use crate::aggregate::{Aggregate, outbox_message};
use crate::contracts::{self, CancelledItem};
use crate::values::{AppliedDiscount, Money, OrderId, OrderLine};

use super::{
    CancellationPolicy, OrderError, OrderEvent, OrderStatus, PaymentStatus, PlaceOrder,
    events::OrderPlacedData,
};

/// Order aggregate root.
///
/// Owns the order's status. Every command re-checks the current status before
/// emitting events: a command whose effect is already in place yields no events, and
/// one that is not an edge of the status graph is rejected.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Order {
    id: Option<OrderId>,
    #[serde(skip)]
    version: Version,
    order_number: String,
    user_id: Option<UserId>,
    lines: Vec<OrderLine>,
    subtotal: Money,
    discount: Option<AppliedDiscount>,
    total: Money,
    status: OrderStatus,
    payment_status: PaymentStatus,
    reservation_ids: Vec<ReservationId>,
    reservation_expires_at: Option<DateTime<Utc>>,
    transaction_id: Option<String>,
    /// Transactions a refund has been requested for.
    #[serde(skip)]
    refunded_transactions: Vec<String>,
    stock_committed: bool,
    status_reason: Option<String>,
    tracking_number: Option<String>,
    placed_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<OrderId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderPlaced(data) => self.apply_placed(data),
            OrderEvent::StockReserved(data) => {
                self.reservation_ids = data.reservation_ids;
                self.reservation_expires_at = Some(data.expires_at);
                self.status = OrderStatus::PendingPayment;
                self.updated_at = Some(data.reserved_at);
            }
            OrderEvent::ReservationRejected(data) => {
                self.status = OrderStatus::Cancelled;
                self.status_reason = Some(data.reason);
                self.updated_at = Some(data.rejected_at);
            }
            OrderEvent::PaymentConfirmed(data) => {
                self.transaction_id = Some(data.transaction_id);
                self.status = OrderStatus::Confirmed;
                self.payment_status = PaymentStatus::Paid;
                self.stock_committed = true;
                self.updated_at = Some(data.confirmed_at);
            }
            OrderEvent::PaymentFailed(data) => {
                if data.transaction_id.is_some() {
                    self.transaction_id = data.transaction_id;
                }
                self.status = OrderStatus::PaymentFailed;
                self.payment_status = PaymentStatus::Failed;
                self.status_reason = Some(data.reason);
                self.updated_at = Some(data.failed_at);
            }
            OrderEvent::RefundRequested(data) => {
                if !self.refunded_transactions.contains(&data.transaction_id) {
                    self.refunded_transactions.push(data.transaction_id.clone());
                }
                self.transaction_id = Some(data.transaction_id);
                self.payment_status = PaymentStatus::RefundRequested;
                self.updated_at = Some(data.requested_at);
            }
            OrderEvent::OrderCancelled(data) => {
                self.status = OrderStatus::Cancelled;
                self.status_reason = Some(data.reason);
                self.updated_at = Some(data.cancelled_at);
            }
            OrderEvent::OrderShipped(data) => {
                self.status = OrderStatus::Shipped;
                self.tracking_number = data.tracking_number;
                self.updated_at = Some(data.shipped_at);
            }
            OrderEvent::OrderDelivered(data) => {
                self.status = OrderStatus::Delivered;
                self.updated_at = Some(data.delivered_at);
            }
        }
    }

    fn integration_messages(
        &self,
        event: &Self::Event,
    ) -> Result<Vec<OutboxMessage>, serde_json::Error> {
        let (Some(order_id), Some(user_id)) = (self.id, self.user_id) else {
            return Ok(Vec::new());
        };

        let cancelled = |reason: &str, stock_committed: bool| contracts::OrderCancelled {
            order_id,
            order_number: self.order_number.clone(),
            user_id,
            discount_id: self.discount.as_ref().map(|d| d.discount_id),
            items: self.cancelled_items(stock_committed),
            reason: reason.to_string(),
        };

        let message = match event {
            OrderEvent::PaymentConfirmed(_) => outbox_message(&contracts::OrderConfirmed {
                order_id,
                order_number: self.order_number.clone(),
                user_id,
                discount_id: self.discount.as_ref().map(|d| d.discount_id),
                discount_amount: self.discount_amount(),
                subtotal_amount: self.subtotal,
                total_amount: self.total,
            })?,
            OrderEvent::ReservationRejected(data) => {
                outbox_message(&cancelled(&data.reason, false))?
            }
            OrderEvent::PaymentFailed(data) => {
                outbox_message(&cancelled(&format!("payment failed: {}", data.reason), false))?
            }
            OrderEvent::OrderCancelled(data) => {
                outbox_message(&cancelled(&data.reason, data.stock_committed))?
            }
            OrderEvent::RefundRequested(data) => outbox_message(&contracts::RefundRequested {
                order_id,
                transaction_id: data.transaction_id.clone(),
                amount: data.amount,
                reason: data.reason.clone(),
            })?,
            OrderEvent::OrderPlaced(_)
            | OrderEvent::StockReserved(_)
            | OrderEvent::OrderShipped(_)
            | OrderEvent::OrderDelivered(_) => return Ok(Vec::new()),
        };

        Ok(vec![message])
    }
}

// Query methods
impl Order {
    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn discount(&self) -> Option<&AppliedDiscount> {
        self.discount.as_ref()
    }

    pub fn discount_amount(&self) -> Money {
        self.discount.as_ref().map(|d| d.amount).unwrap_or_default()
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn reservation_ids(&self) -> &[ReservationId] {
        &self.reservation_ids
    }

    pub fn reservation_expires_at(&self) -> Option<DateTime<Utc>> {
        self.reservation_expires_at
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// On-hand stock was deducted for this order (payment was confirmed).
    pub fn stock_committed(&self) -> bool {
        self.stock_committed
    }

    /// Why the order was cancelled or its payment failed.
    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.placed_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn total_quantity(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    pub fn cancelled_items(&self, stock_committed: bool) -> Vec<CancelledItem> {
        self.lines
            .iter()
            .map(|line| CancelledItem {
                product_id: line.product_id.clone(),
                variant_id: line.variant_id.clone(),
                quantity: line.quantity,
                stock_committed,
            })
            .collect()
    }
}

// Command methods (return events)
impl Order {
    pub fn place(&self, cmd: PlaceOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyPlaced);
        }
        if cmd.lines.is_empty() {
            return Err(OrderError::NoLines);
        }
        for line in &cmd.lines {
            if line.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: line.product_id.to_string(),
                    quantity: line.quantity,
                });
            }
            if !line.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    product_id: line.product_id.to_string(),
                    price: line.unit_price.cents(),
                });
            }
        }

        let subtotal: Money = cmd.lines.iter().map(OrderLine::total_price).sum();
        let discount = cmd.discount.map(|mut d| {
            d.amount = d.amount.max(Money::ZERO).min(subtotal);
            d
        });
        let total = subtotal.saturating_sub(discount.as_ref().map(|d| d.amount).unwrap_or_default());
        let placed_at = Utc::now();

        Ok(vec![OrderEvent::OrderPlaced(OrderPlacedData {
            order_id: cmd.order_id,
            order_number: order_number(cmd.order_id, placed_at),
            user_id: cmd.user_id,
            lines: cmd.lines,
            subtotal,
            discount,
            total,
            placed_at,
        })])
    }

    pub fn record_reservation(
        &self,
        reservation_ids: Vec<ReservationId>,
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.status == OrderStatus::PendingPayment {
            return Ok(vec![]);
        }
        self.ensure_transition(OrderStatus::PendingPayment)?;

        Ok(vec![OrderEvent::stock_reserved(reservation_ids, expires_at)])
    }

    /// Reservation failed before any stock was held.
    pub fn reject_reservation(&self, reason: impl Into<String>) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::Cancelled => Ok(vec![]),
            OrderStatus::Created => Ok(vec![OrderEvent::reservation_rejected(reason)]),
            from => Err(OrderError::InvalidStateTransition {
                from,
                to: OrderStatus::Cancelled,
            }),
        }
    }

    pub fn confirm_payment(&self, transaction_id: &str) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.status.is_paid() && self.transaction_id.as_deref() == Some(transaction_id) {
            return Ok(vec![]);
        }
        self.ensure_transition(OrderStatus::Confirmed)?;

        Ok(vec![OrderEvent::payment_confirmed(transaction_id)])
    }

    /// Marks the payment failed. With a `transaction_id` the provider did take the
    /// money, so a refund is requested in the same step.
    pub fn fail_payment(
        &self,
        reason: impl Into<String>,
        transaction_id: Option<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.status == OrderStatus::PaymentFailed {
            return Ok(vec![]);
        }
        self.ensure_transition(OrderStatus::PaymentFailed)?;

        let reason = reason.into();
        let mut events = vec![OrderEvent::payment_failed(reason.clone(), transaction_id.clone())];
        if let Some(transaction_id) = transaction_id {
            events.push(OrderEvent::refund_requested(transaction_id, self.total, reason));
        }
        Ok(events)
    }

    /// Requests a refund for a payment that arrived for an order that is no longer
    /// going to be fulfilled. Each transaction is refunded at most once.
    pub fn request_refund(
        &self,
        transaction_id: &str,
        reason: impl Into<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.refunded_transactions.iter().any(|t| t == transaction_id) {
            return Ok(vec![]);
        }
        if !matches!(
            self.status,
            OrderStatus::Cancelled | OrderStatus::PaymentFailed
        ) {
            return Err(OrderError::RefundNotApplicable {
                status: self.status,
            });
        }

        Ok(vec![OrderEvent::refund_requested(transaction_id, self.total, reason)])
    }

    /// Cancels the order. Cancelling a paid order also requests a refund.
    pub fn cancel(
        &self,
        reason: impl Into<String>,
        cancelled_by: Option<String>,
        policy: &CancellationPolicy,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.status == OrderStatus::Cancelled {
            return Ok(vec![]);
        }
        self.ensure_transition(OrderStatus::Cancelled)?;
        if !policy.permits(self.status) {
            return Err(OrderError::CancellationNotAllowed {
                status: self.status,
            });
        }

        let reason = reason.into();
        let mut events = vec![OrderEvent::order_cancelled(
            reason.clone(),
            cancelled_by,
            self.stock_committed,
        )];
        if self.payment_status == PaymentStatus::Paid
            && let Some(transaction_id) = &self.transaction_id
        {
            events.push(OrderEvent::refund_requested(
                transaction_id.clone(),
                self.total,
                format!("order cancelled: {reason}"),
            ));
        }
        Ok(events)
    }

    pub fn ship(&self, tracking_number: Option<String>) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if matches!(self.status, OrderStatus::Shipped | OrderStatus::Delivered) {
            return Ok(vec![]);
        }
        self.ensure_transition(OrderStatus::Shipped)?;

        Ok(vec![OrderEvent::order_shipped(tracking_number)])
    }

    pub fn deliver(&self) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.status == OrderStatus::Delivered {
            return Ok(vec![]);
        }
        self.ensure_transition(OrderStatus::Delivered)?;

        Ok(vec![OrderEvent::order_delivered()])
    }

    fn ensure_placed(&self) -> Result<(), OrderError> {
        if self.id.is_none() {
            return Err(OrderError::NotPlaced);
        }
        Ok(())
    }

    fn ensure_transition(&self, to: OrderStatus) -> Result<(), OrderError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(OrderError::InvalidStateTransition {
                from: self.status,
                to,
            })
        }
    }
}

// Apply event helpers
impl Order {
    fn apply_placed(&mut self, data: OrderPlacedData) {
        self.id = Some(data.order_id);
        self.order_number = data.order_number;
        self.user_id = Some(data.user_id);
        self.lines = data.lines;
        self.subtotal = data.subtotal;
        self.discount = data.discount;
        self.total = data.total;
        self.status = OrderStatus::Created;
        self.payment_status = PaymentStatus::Pending;
        self.placed_at = Some(data.placed_at);
        self.updated_at = Some(data.placed_at);
    }
}

/// `ORD-YYYYMMDD-XXXXXXXX`, the suffix taken from the order id.
fn order_number(order_id: OrderId, placed_at: DateTime<Utc>) -> String {
    let suffix: String = order_id
        .as_uuid()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect();
    format!(
        "ORD-{}-{}",
        placed_at.format("%Y%m%d"),
        suffix.to_uppercase()
    )
}
