//! Stock ledger storage.
//!
//! Every method is one atomic step: either all of its changes (stock levels,
//! reservation status, audit records) are applied, or none are.

mod memory;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ReservationId;
use domain::{OrderId, ProductId, VariantId};

use crate::Result;
use crate::model::{
    Allocation, InventoryTransaction, Reserved, ReturnLine, StockItem, StockKey,
    StockReservation,
};

#[async_trait]
pub trait StockLedger: Send + Sync + 'static {
    /// Adds on-hand stock, creating the item on first receipt.
    async fn receive(&self, key: &StockKey, quantity: u32, reason: &str) -> Result<StockItem>;

    async fn item(&self, key: &StockKey) -> Result<Option<StockItem>>;

    /// Items for a product (and variant) across all warehouses.
    async fn items_for_product(
        &self,
        product_id: &ProductId,
        variant_id: Option<&VariantId>,
    ) -> Result<Vec<StockItem>>;

    /// Holds every allocation or none of them.
    ///
    /// An order that already holds Pending or Committed reservations gets those back
    /// as [`Reserved::Existing`]; the check runs in the same atomic step as the hold.
    /// Fails with `ConcurrencyConflict` when an item's version moved since it was
    /// read, and with `InsufficientStock` when an item no longer has enough available.
    async fn reserve(
        &self,
        order_id: OrderId,
        allocations: &[Allocation],
        expires_at: DateTime<Utc>,
    ) -> Result<Reserved>;

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>>;

    /// Commits the order's Pending reservations. Returns the ones that changed.
    async fn commit(&self, order_id: OrderId) -> Result<Vec<StockReservation>>;

    /// Releases the order's Pending reservations, optionally only the given ones.
    async fn release(
        &self,
        order_id: OrderId,
        reservation_ids: Option<&[ReservationId]>,
        reason: &str,
    ) -> Result<Vec<StockReservation>>;

    /// Puts committed units back on hand, never more than were committed.
    /// An empty `lines` returns everything still outstanding. Returns the units moved.
    async fn return_committed(
        &self,
        order_id: OrderId,
        lines: &[ReturnLine],
        reason: &str,
    ) -> Result<u32>;

    /// Expires up to `limit` Pending reservations whose TTL ran out before `now`.
    async fn expire_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<StockReservation>>;

    async fn transactions_for_order(&self, order_id: OrderId)
    -> Result<Vec<InventoryTransaction>>;
}

/// Splits `lines` over the order's committed reservations, oldest first.
/// Yields `(reservation index, units)`.
pub(crate) fn plan_returns(
    reservations: &[StockReservation],
    lines: &[ReturnLine],
) -> Vec<(usize, u32)> {
    let mut remaining: Vec<u32> = reservations.iter().map(|r| r.returnable()).collect();
    let mut plan = Vec::new();

    if lines.is_empty() {
        for (idx, units) in remaining.into_iter().enumerate() {
            if units > 0 {
                plan.push((idx, units));
            }
        }
        return plan;
    }

    for line in lines {
        let mut wanted = line.quantity;
        for (idx, reservation) in reservations.iter().enumerate() {
            if wanted == 0 {
                break;
            }
            if !reservation
                .key
                .is_product(&line.product_id, line.variant_id.as_ref())
            {
                continue;
            }
            let units = wanted.min(remaining[idx]);
            if units > 0 {
                remaining[idx] -= units;
                wanted -= units;
                plan.push((idx, units));
            }
        }
    }
    plan
}
