//! What the orchestrator needs from the inventory and discount services.

use async_trait::async_trait;
use chrono::Duration;
use common::UserId;
use discount::{
    DiscountError, DiscountLine, DiscountStore, DiscountTracker, DiscountValidation,
    RecordOutcome, RecordUsage, RollbackOutcome,
};
use domain::{Money, OrderId};
use inventory::{
    InventoryError, OperationOutcome, ReservationEngine, ReservationLine, ReservationReceipt,
    ReturnLine, StockLedger, StockReservation,
};

#[async_trait]
pub trait InventoryService: Send + Sync + 'static {
    /// All or nothing. `ttl` falls back to the service default.
    async fn reserve(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        ttl: Option<Duration>,
    ) -> Result<ReservationReceipt, InventoryError>;

    async fn commit(&self, order_id: OrderId) -> Result<OperationOutcome, InventoryError>;

    async fn release(&self, order_id: OrderId, reason: &str)
    -> Result<OperationOutcome, InventoryError>;

    /// Empty `lines` returns everything the order still has committed.
    async fn return_stock(
        &self,
        order_id: OrderId,
        lines: &[ReturnLine],
        reason: &str,
    ) -> Result<OperationOutcome, InventoryError>;

    async fn reservations(&self, order_id: OrderId)
    -> Result<Vec<StockReservation>, InventoryError>;
}

#[async_trait]
pub trait DiscountService: Send + Sync + 'static {
    async fn validate(
        &self,
        code: &str,
        order_amount: Money,
        items: &[DiscountLine],
        user_id: Option<UserId>,
    ) -> Result<DiscountValidation, DiscountError>;

    async fn record_usage(&self, request: RecordUsage) -> Result<RecordOutcome, DiscountError>;

    async fn rollback_usage(&self, order_id: OrderId) -> Result<RollbackOutcome, DiscountError>;
}

#[async_trait]
impl<L: StockLedger> InventoryService for ReservationEngine<L> {
    async fn reserve(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        ttl: Option<Duration>,
    ) -> Result<ReservationReceipt, InventoryError> {
        ReservationEngine::reserve(self, order_id, lines, ttl).await
    }

    async fn commit(&self, order_id: OrderId) -> Result<OperationOutcome, InventoryError> {
        ReservationEngine::commit(self, order_id).await
    }

    async fn release(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> Result<OperationOutcome, InventoryError> {
        ReservationEngine::release(self, order_id, reason).await
    }

    async fn return_stock(
        &self,
        order_id: OrderId,
        lines: &[ReturnLine],
        reason: &str,
    ) -> Result<OperationOutcome, InventoryError> {
        ReservationEngine::return_stock(self, order_id, lines, reason).await
    }

    async fn reservations(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<StockReservation>, InventoryError> {
        ReservationEngine::reservations(self, order_id).await
    }
}

#[async_trait]
impl<S: DiscountStore> DiscountService for DiscountTracker<S> {
    async fn validate(
        &self,
        code: &str,
        order_amount: Money,
        items: &[DiscountLine],
        user_id: Option<UserId>,
    ) -> Result<DiscountValidation, DiscountError> {
        DiscountTracker::validate(self, code, order_amount, items, user_id).await
    }

    async fn record_usage(&self, request: RecordUsage) -> Result<RecordOutcome, DiscountError> {
        DiscountTracker::record_usage(self, request).await
    }

    async fn rollback_usage(&self, order_id: OrderId) -> Result<RollbackOutcome, DiscountError> {
        DiscountTracker::rollback_usage(self, order_id).await
    }
}
