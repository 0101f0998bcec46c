use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ReservationId;
use domain::{OrderId, ProductId, VariantId};
use tokio::sync::RwLock;

use super::{StockLedger, plan_returns};
use crate::model::{
    Allocation, InventoryTransaction, ReservationStatus, Reserved, ReturnLine, Shortfall,
    StockItem, StockKey, StockReservation, TransactionKind,
};
use crate::{InventoryError, Result};

/// Stock items live in a flat arena addressed by slot; the key index and the
/// per-order reservation index point into it.
#[derive(Debug, Default)]
struct Arena {
    items: Vec<StockItem>,
    index: HashMap<StockKey, usize>,
    reservations: Vec<StockReservation>,
    by_order: HashMap<OrderId, Vec<usize>>,
    transactions: Vec<InventoryTransaction>,
}

impl Arena {
    fn slot(&self, key: &StockKey) -> Result<usize> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| InventoryError::StockItemNotFound(key.clone()))
    }

    fn slot_or_insert(&mut self, key: &StockKey) -> usize {
        if let Some(slot) = self.index.get(key) {
            return *slot;
        }
        self.items.push(StockItem::new(key.clone()));
        let slot = self.items.len() - 1;
        self.index.insert(key.clone(), slot);
        slot
    }

    fn adjust(
        &mut self,
        slot: usize,
        kind: TransactionKind,
        units: u32,
        order_id: Option<OrderId>,
        reason: &str,
    ) {
        let (quantity_delta, reserved_delta) = kind.deltas(units);
        let item = &mut self.items[slot];
        let before = item.clone();

        item.quantity += quantity_delta;
        item.reserved_quantity += reserved_delta;
        item.version += 1;
        item.updated_at = Utc::now();

        let record = InventoryTransaction::record(kind, &before, item, order_id, reason);
        self.transactions.push(record);
    }

    fn order_slots(&self, order_id: OrderId) -> Vec<usize> {
        self.by_order.get(&order_id).cloned().unwrap_or_default()
    }

    /// Moves one Pending reservation to `status`, adjusting its stock item.
    fn settle(&mut self, idx: usize, status: ReservationStatus, reason: &str) -> Result<()> {
        let reservation = &self.reservations[idx];
        let (slot, units, order_id) = (
            self.slot(&reservation.key)?,
            reservation.quantity,
            reservation.order_id,
        );
        let kind = match status {
            ReservationStatus::Committed => TransactionKind::Commit,
            ReservationStatus::Expired => TransactionKind::Expiration,
            _ => TransactionKind::Release,
        };

        self.adjust(slot, kind, units, Some(order_id), reason);
        let reservation = &mut self.reservations[idx];
        reservation.status = status;
        reservation.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    arena: Arc<RwLock<Arena>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StockLedger for InMemoryLedger {
    async fn receive(&self, key: &StockKey, quantity: u32, reason: &str) -> Result<StockItem> {
        let mut arena = self.arena.write().await;
        let slot = arena.slot_or_insert(key);
        arena.adjust(slot, TransactionKind::Receipt, quantity, None, reason);
        Ok(arena.items[slot].clone())
    }

    async fn item(&self, key: &StockKey) -> Result<Option<StockItem>> {
        let arena = self.arena.read().await;
        Ok(arena.index.get(key).map(|slot| arena.items[*slot].clone()))
    }

    async fn items_for_product(
        &self,
        product_id: &ProductId,
        variant_id: Option<&VariantId>,
    ) -> Result<Vec<StockItem>> {
        let arena = self.arena.read().await;
        let mut items: Vec<_> = arena
            .items
            .iter()
            .filter(|item| item.key.is_product(product_id, variant_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.key.warehouse_id.cmp(&b.key.warehouse_id));
        Ok(items)
    }

    async fn reserve(
        &self,
        order_id: OrderId,
        allocations: &[Allocation],
        expires_at: DateTime<Utc>,
    ) -> Result<Reserved> {
        let mut arena = self.arena.write().await;

        let held: Vec<_> = arena
            .order_slots(order_id)
            .into_iter()
            .map(|idx| &arena.reservations[idx])
            .filter(|r| r.status.holds_stock())
            .cloned()
            .collect();
        if !held.is_empty() {
            return Ok(Reserved::Existing(held));
        }

        // Check everything before touching anything.
        let mut slots = Vec::with_capacity(allocations.len());
        let mut shortfalls = Vec::new();
        for allocation in allocations {
            let slot = arena.slot(&allocation.key)?;
            let item = &arena.items[slot];
            if item.version != allocation.expected_version {
                return Err(InventoryError::ConcurrencyConflict(allocation.key.clone()));
            }
            if item.available() < i64::from(allocation.quantity) {
                shortfalls.push(Shortfall {
                    product_id: item.key.product_id.clone(),
                    variant_id: item.key.variant_id.clone(),
                    requested: allocation.quantity,
                    available: item.available(),
                });
            }
            slots.push(slot);
        }
        if !shortfalls.is_empty() {
            return Err(InventoryError::InsufficientStock(shortfalls));
        }

        let mut created = Vec::with_capacity(allocations.len());
        for (allocation, slot) in allocations.iter().zip(slots) {
            arena.adjust(
                slot,
                TransactionKind::Reservation,
                allocation.quantity,
                Some(order_id),
                "reserved for order",
            );
            let reservation = StockReservation::new(
                order_id,
                allocation.key.clone(),
                allocation.quantity,
                expires_at,
            );
            arena.reservations.push(reservation.clone());
            let idx = arena.reservations.len() - 1;
            arena.by_order.entry(order_id).or_default().push(idx);
            created.push(reservation);
        }

        Ok(Reserved::Created(created))
    }

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        let arena = self.arena.read().await;
        Ok(arena
            .order_slots(order_id)
            .into_iter()
            .map(|idx| arena.reservations[idx].clone())
            .collect())
    }

    async fn commit(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        let mut arena = self.arena.write().await;
        let mut changed = Vec::new();
        for idx in arena.order_slots(order_id) {
            if arena.reservations[idx].status == ReservationStatus::Pending {
                arena.settle(idx, ReservationStatus::Committed, "payment confirmed")?;
                changed.push(arena.reservations[idx].clone());
            }
        }
        Ok(changed)
    }

    async fn release(
        &self,
        order_id: OrderId,
        reservation_ids: Option<&[ReservationId]>,
        reason: &str,
    ) -> Result<Vec<StockReservation>> {
        let mut arena = self.arena.write().await;
        let mut changed = Vec::new();
        for idx in arena.order_slots(order_id) {
            let reservation = &arena.reservations[idx];
            let selected = reservation_ids.is_none_or(|ids| ids.contains(&reservation.id));
            if selected && reservation.status == ReservationStatus::Pending {
                arena.settle(idx, ReservationStatus::Released, reason)?;
                changed.push(arena.reservations[idx].clone());
            }
        }
        Ok(changed)
    }

    async fn return_committed(
        &self,
        order_id: OrderId,
        lines: &[ReturnLine],
        reason: &str,
    ) -> Result<u32> {
        let mut arena = self.arena.write().await;
        let indices = arena.order_slots(order_id);
        let reservations: Vec<_> = indices
            .iter()
            .map(|idx| arena.reservations[*idx].clone())
            .collect();

        let mut returned = 0;
        for (pos, units) in plan_returns(&reservations, lines) {
            let idx = indices[pos];
            let slot = arena.slot(&arena.reservations[idx].key)?;
            arena.adjust(slot, TransactionKind::Return, units, Some(order_id), reason);

            let reservation = &mut arena.reservations[idx];
            reservation.returned_quantity += units;
            reservation.updated_at = Utc::now();
            returned += units;
        }
        Ok(returned)
    }

    async fn expire_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<StockReservation>> {
        let mut arena = self.arena.write().await;
        let mut due: Vec<usize> = (0..arena.reservations.len())
            .filter(|idx| arena.reservations[*idx].is_due(now))
            .collect();
        due.sort_by_key(|idx| arena.reservations[*idx].expires_at);
        due.truncate(limit);

        let mut expired = Vec::with_capacity(due.len());
        for idx in due {
            arena.settle(idx, ReservationStatus::Expired, "reservation expired")?;
            expired.push(arena.reservations[idx].clone());
        }
        Ok(expired)
    }

    async fn transactions_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<InventoryTransaction>> {
        let arena = self.arena.read().await;
        Ok(arena
            .transactions
            .iter()
            .filter(|tx| tx.order_id == Some(order_id))
            .cloned()
            .collect())
    }
}
