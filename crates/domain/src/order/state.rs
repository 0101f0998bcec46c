//! Order status machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an order.
///
/// ```text
/// Created ──reserve ok──► PendingPayment ──payment ok──► Confirmed ──► Shipped ──► Delivered
///    │                      │      │                          │            │
///    │ reserve fails        │      └──payment failed──► PaymentFailed      │
///    ▼                      ▼                                 │            │
/// Cancelled ◄───────────────┴─────────────────────────────────┴────────────┘
///                                                      (policy-gated after confirmation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    #[default]
    Created,
    PendingPayment,
    Confirmed,
    PaymentFailed,
    Cancelled,
    Shipped,
    Delivered,
}

impl OrderStatus {
    /// Whether `self -> to` is an edge of the status graph.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Created, PendingPayment)
                | (Created, Cancelled)
                | (PendingPayment, Confirmed)
                | (PendingPayment, PaymentFailed)
                | (PendingPayment, Cancelled)
                | (PaymentFailed, Cancelled)
                | (Confirmed, Shipped)
                | (Shipped, Delivered)
                | (Confirmed, Cancelled)
                | (Shipped, Cancelled)
        )
    }

    /// No transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Delivered)
    }

    /// Payment was captured for the order at some point.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Shipped | OrderStatus::Delivered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "Created",
            OrderStatus::PendingPayment => "PendingPayment",
            OrderStatus::Confirmed => "Confirmed",
            OrderStatus::PaymentFailed => "PaymentFailed",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Delivered => "Delivered",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    /// Money was taken but the order will not be fulfilled.
    RefundRequested,
}

/// Which post-payment states still allow a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub allow_after_confirmation: bool,
    pub allow_after_shipment: bool,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            allow_after_confirmation: true,
            allow_after_shipment: false,
        }
    }
}

impl CancellationPolicy {
    pub fn permits(&self, status: OrderStatus) -> bool {
        match status {
            OrderStatus::Confirmed => self.allow_after_confirmation,
            OrderStatus::Shipped => self.allow_after_shipment,
            _ => true,
        }
    }
}
