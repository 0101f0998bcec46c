//! Payment gateway port and in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use common::UserId;
use domain::{Money, OrderId};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),

    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
}

impl PaymentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::Unavailable(_))
    }
}

/// What the provider needs to start collecting money for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub order_number: String,
    pub user_id: UserId,
    pub amount: Money,
}

/// The provider accepted the request. The outcome arrives later through a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub transaction_id: String,
    pub amount: Money,
    pub reason: String,
}

/// External payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentIntent, PaymentError>;

    /// Must be idempotent per transaction id.
    async fn refund(
        &self,
        transaction_id: &str,
        amount: Money,
        reason: &str,
    ) -> Result<(), PaymentError>;
}

#[derive(Debug, Default)]
struct GatewayState {
    initiated: Vec<(PaymentIntent, PaymentRequest)>,
    refunds: Vec<Refund>,
    next_id: u32,
    decline: bool,
    unavailable_for: u32,
}

/// Stand-in for the payment provider with failure injection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every request until switched off.
    pub async fn set_decline(&self, decline: bool) {
        self.state.lock().await.decline = decline;
    }

    /// Fails the next `calls` calls as unavailable.
    pub async fn set_unavailable_for(&self, calls: u32) {
        self.state.lock().await.unavailable_for = calls;
    }

    pub async fn initiated(&self) -> Vec<PaymentRequest> {
        self.state
            .lock()
            .await
            .initiated
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub async fn refunds(&self) -> Vec<Refund> {
        self.state.lock().await.refunds.clone()
    }
}

fn check_available(state: &mut GatewayState) -> Result<(), PaymentError> {
    if state.unavailable_for > 0 {
        state.unavailable_for -= 1;
        return Err(PaymentError::Unavailable("connection refused".into()));
    }
    Ok(())
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentIntent, PaymentError> {
        let mut state = self.state.lock().await;
        check_available(&mut state)?;
        if state.decline {
            return Err(PaymentError::Declined("card declined".into()));
        }

        state.next_id += 1;
        let intent = PaymentIntent {
            payment_id: format!("PAY-{:04}", state.next_id),
        };
        state.initiated.push((intent.clone(), request.clone()));
        Ok(intent)
    }

    async fn refund(
        &self,
        transaction_id: &str,
        amount: Money,
        reason: &str,
    ) -> Result<(), PaymentError> {
        let mut state = self.state.lock().await;
        check_available(&mut state)?;
        if state
            .refunds
            .iter()
            .any(|r| r.transaction_id == transaction_id)
        {
            return Ok(());
        }
        state.refunds.push(Refund {
            transaction_id: transaction_id.to_string(),
            amount,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
