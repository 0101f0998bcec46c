//! Order domain events.

use chrono::{DateTime, Utc};
use common::{ReservationId, UserId};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;
use crate::values::{AppliedDiscount, Money, OrderId, OrderLine};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    OrderPlaced(OrderPlacedData),

    /// Inventory holds stock for every line.
    StockReserved(StockReservedData),

    /// Inventory could not reserve the order; the order is cancelled.
    ReservationRejected(ReservationRejectedData),

    PaymentConfirmed(PaymentConfirmedData),

    PaymentFailed(PaymentFailedData),

    /// Compensating refund signal for money taken on an order that will not ship.
    RefundRequested(RefundRequestedData),

    OrderCancelled(OrderCancelledData),

    OrderShipped(OrderShippedData),

    OrderDelivered(OrderDeliveredData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "OrderPlaced",
            OrderEvent::StockReserved(_) => "StockReserved",
            OrderEvent::ReservationRejected(_) => "ReservationRejected",
            OrderEvent::PaymentConfirmed(_) => "PaymentConfirmed",
            OrderEvent::PaymentFailed(_) => "PaymentFailed",
            OrderEvent::RefundRequested(_) => "RefundRequested",
            OrderEvent::OrderCancelled(_) => "OrderCancelled",
            OrderEvent::OrderShipped(_) => "OrderShipped",
            OrderEvent::OrderDelivered(_) => "OrderDelivered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedData {
    pub order_id: OrderId,
    pub order_number: String,
    pub user_id: UserId,
    pub lines: Vec<OrderLine>,
    pub subtotal: Money,
    pub discount: Option<AppliedDiscount>,
    pub total: Money,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReservedData {
    pub reservation_ids: Vec<ReservationId>,
    pub expires_at: DateTime<Utc>,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRejectedData {
    /// Human-readable shortfall, e.g. which product was missing stock.
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmedData {
    pub transaction_id: String,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub reason: String,
    /// Set when the provider took the money but the order cannot be fulfilled.
    pub transaction_id: Option<String>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequestedData {
    pub transaction_id: String,
    pub amount: Money,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub reason: String,
    pub cancelled_by: Option<String>,
    /// Stock had been committed when the order was cancelled, so it must be returned.
    pub stock_committed: bool,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderShippedData {
    pub tracking_number: Option<String>,
    pub shipped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDeliveredData {
    pub delivered_at: DateTime<Utc>,
}

// Constructors stamp the current time.
impl OrderEvent {
    pub fn stock_reserved(reservation_ids: Vec<ReservationId>, expires_at: DateTime<Utc>) -> Self {
        OrderEvent::StockReserved(StockReservedData {
            reservation_ids,
            expires_at,
            reserved_at: Utc::now(),
        })
    }

    pub fn reservation_rejected(reason: impl Into<String>) -> Self {
        OrderEvent::ReservationRejected(ReservationRejectedData {
            reason: reason.into(),
            rejected_at: Utc::now(),
        })
    }

    pub fn payment_confirmed(transaction_id: impl Into<String>) -> Self {
        OrderEvent::PaymentConfirmed(PaymentConfirmedData {
            transaction_id: transaction_id.into(),
            confirmed_at: Utc::now(),
        })
    }

    pub fn payment_failed(reason: impl Into<String>, transaction_id: Option<String>) -> Self {
        OrderEvent::PaymentFailed(PaymentFailedData {
            reason: reason.into(),
            transaction_id,
            failed_at: Utc::now(),
        })
    }

    pub fn refund_requested(
        transaction_id: impl Into<String>,
        amount: Money,
        reason: impl Into<String>,
    ) -> Self {
        OrderEvent::RefundRequested(RefundRequestedData {
            transaction_id: transaction_id.into(),
            amount,
            reason: reason.into(),
            requested_at: Utc::now(),
        })
    }

    pub fn order_cancelled(
        reason: impl Into<String>,
        cancelled_by: Option<String>,
        stock_committed: bool,
    ) -> Self {
        OrderEvent::OrderCancelled(OrderCancelledData {
            reason: reason.into(),
            cancelled_by,
            stock_committed,
            cancelled_at: Utc::now(),
        })
    }

    pub fn order_shipped(tracking_number: Option<String>) -> Self {
        OrderEvent::OrderShipped(OrderShippedData {
            tracking_number,
            shipped_at: Utc::now(),
        })
    }

    pub fn order_delivered() -> Self {
        OrderEvent::OrderDelivered(OrderDeliveredData {
            delivered_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = OrderEvent::payment_failed("card declined", None);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "PaymentFailed");
        assert_eq!(json["data"]["reason"], "card declined");
        assert_eq!(event.event_type(), "PaymentFailed");

        let back: OrderEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, OrderEvent::PaymentFailed(d) if d.transaction_id.is_none()));
    }
}
