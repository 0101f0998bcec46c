//! Integration events exchanged between services over the event bus.
//!
//! Field names are camelCase on the wire. Every contract carries the order id so
//! consumers can re-check their own state for that order before acting.

use common::{DiscountId, UserId};
use event_bus::BusEvent;
use serde::{Deserialize, Serialize};

use crate::values::{Money, OrderId, ProductId, VariantId};

pub mod topics {
    pub const ORDER_CONFIRMED: &str = "order.confirmed";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const ORDER_CANCELLATION_REQUESTED: &str = "order.cancellation_requested";
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const PAYMENT_REFUND_REQUESTED: &str = "payment.refund_requested";
    pub const USER_PROFILE_UPDATED: &str = "user.profile_updated";
}

/// Payment went through and stock was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub order_number: String,
    pub user_id: UserId,
    pub discount_id: Option<DiscountId>,
    pub discount_amount: Money,
    /// Order amount before the discount.
    pub subtotal_amount: Money,
    pub total_amount: Money,
}

impl BusEvent for OrderConfirmed {
    const MESSAGE_TYPE: &'static str = "OrderConfirmed";
    const TOPIC: &'static str = topics::ORDER_CONFIRMED;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledItem {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
    /// The stock was already deducted from on-hand quantity and must be returned
    /// rather than released.
    pub stock_committed: bool,
}

/// The order will not be fulfilled; its stock and discount usage should be freed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub order_number: String,
    pub user_id: UserId,
    pub discount_id: Option<DiscountId>,
    pub items: Vec<CancelledItem>,
    pub reason: String,
}

impl OrderCancelled {
    pub fn any_stock_committed(&self) -> bool {
        self.items.iter().any(|i| i.stock_committed)
    }
}

impl BusEvent for OrderCancelled {
    const MESSAGE_TYPE: &'static str = "OrderCancelled";
    const TOPIC: &'static str = topics::ORDER_CANCELLED;
}

/// A user or an admin asked for an order to be cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancellationRequested {
    pub order_id: OrderId,
    pub reason: String,
    pub requested_by: Option<String>,
}

impl BusEvent for OrderCancellationRequested {
    const MESSAGE_TYPE: &'static str = "OrderCancellationRequested";
    const TOPIC: &'static str = topics::ORDER_CANCELLATION_REQUESTED;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSuccess {
    pub order_id: OrderId,
    pub transaction_id: String,
}

impl BusEvent for PaymentSuccess {
    const MESSAGE_TYPE: &'static str = "PaymentSuccess";
    const TOPIC: &'static str = topics::PAYMENT_SUCCEEDED;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: OrderId,
    pub error_message: String,
    /// Machine-readable cause, e.g. `card_declined`.
    pub failure_reason: String,
}

impl BusEvent for PaymentFailed {
    const MESSAGE_TYPE: &'static str = "PaymentFailed";
    const TOPIC: &'static str = topics::PAYMENT_FAILED;
}

/// Money was taken for an order that will not be fulfilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequested {
    pub order_id: OrderId,
    pub transaction_id: String,
    pub amount: Money,
    pub reason: String,
}

impl BusEvent for RefundRequested {
    const MESSAGE_TYPE: &'static str = "RefundRequested";
    const TOPIC: &'static str = topics::PAYMENT_REFUND_REQUESTED;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileUpdated {
    pub user_id: UserId,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
}

impl BusEvent for UserProfileUpdated {
    const MESSAGE_TYPE: &'static str = "UserProfileUpdated";
    const TOPIC: &'static str = topics::USER_PROFILE_UPDATED;
}

#[cfg(test)]
mod tests {
    use event_bus::Message;

    use super::*;

    #[test]
    fn contracts_use_camel_case_on_the_wire() {
        let event = PaymentFailed {
            order_id: OrderId::new(),
            error_message: "Card declined".into(),
            failure_reason: "card_declined".into(),
        };
        let msg = Message::from_event(&event).unwrap();

        assert_eq!(msg.topic, "payment.failed");
        assert_eq!(msg.payload["errorMessage"], "Card declined");
        assert_eq!(msg.decode::<PaymentFailed>().unwrap(), event);
    }

    #[test]
    fn cancelled_items_report_committed_stock() {
        let mut event = OrderCancelled {
            order_id: OrderId::new(),
            order_number: "ORD-20260101-ABCDEF12".into(),
            user_id: UserId::new(),
            discount_id: None,
            items: vec![CancelledItem {
                product_id: ProductId::new("SKU-1"),
                variant_id: None,
                quantity: 2,
                stock_committed: false,
            }],
            reason: "customer request".into(),
        };
        assert!(!event.any_stock_committed());

        event.items[0].stock_committed = true;
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["items"][0]["stockCommitted"], true);
        assert!(event.any_stock_committed());
    }
}
