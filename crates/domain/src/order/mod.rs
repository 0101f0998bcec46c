//! Order aggregate and related types.

mod aggregate;
mod events;
mod service;
mod state;

pub use aggregate::Order;
pub use events::{
    OrderCancelledData, OrderDeliveredData, OrderEvent, OrderPlacedData, OrderShippedData,
    PaymentConfirmedData, PaymentFailedData, RefundRequestedData, ReservationRejectedData,
    StockReservedData,
};
pub use service::OrderService;
pub use state::{CancellationPolicy, OrderStatus, PaymentStatus};

use common::UserId;
use thiserror::Error;

use crate::values::{AppliedDiscount, OrderId, OrderLine};

/// Input for placing a new order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub lines: Vec<OrderLine>,
    /// Already validated against the discount service.
    pub discount: Option<AppliedDiscount>,
}

impl PlaceOrder {
    pub fn new(user_id: UserId, lines: Vec<OrderLine>) -> Self {
        Self {
            order_id: OrderId::new(),
            user_id,
            lines,
            discount: None,
        }
    }

    pub fn with_discount(mut self, discount: AppliedDiscount) -> Self {
        self.discount = Some(discount);
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum OrderError {
    #[error("Order already placed")]
    AlreadyPlaced,

    #[error("Order has not been placed")]
    NotPlaced,

    #[error("Order has no lines")]
    NoLines,

    #[error("Invalid quantity {quantity} for {product_id} (must be greater than 0)")]
    InvalidQuantity { product_id: String, quantity: u32 },

    #[error("Invalid price {price} for {product_id} (must be greater than 0)")]
    InvalidPrice { product_id: String, price: i64 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    #[error("Cancellation not allowed for {status} orders")]
    CancellationNotAllowed { status: OrderStatus },

    #[error("No refund applies to a {status} order")]
    RefundNotApplicable { status: OrderStatus },
}
