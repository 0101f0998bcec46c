//! Reservation engine: check-and-reserve, commit, release, return and expiry.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use common::ReservationId;
use domain::{OrderId, ProductId, VariantId};

use crate::ledger::StockLedger;
use crate::model::{
    Allocation, InventoryTransaction, ItemAvailability, OperationOutcome, ReservationLine,
    ReservationReceipt, Reserved, ReturnLine, Shortfall, StockCheck, StockItem, StockKey,
    StockReservation,
};
use crate::{InventoryError, Result};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL used when the caller does not pass one.
    pub default_ttl: Duration,
    /// Re-reads after losing a version race before giving up.
    pub conflict_retries: u32,
    /// Reservations expired per sweep pass.
    pub sweep_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::minutes(15),
            conflict_retries: 5,
            sweep_batch_size: 100,
        }
    }
}

impl EngineConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size.max(1);
        self
    }
}

/// Owns every change to stock levels and reservations.
pub struct ReservationEngine<L: StockLedger> {
    ledger: L,
    config: EngineConfig,
}

impl<L: StockLedger> ReservationEngine<L> {
    pub fn new(ledger: L, config: EngineConfig) -> Self {
        Self { ledger, config }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Goods receipt.
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    pub async fn receive_stock(
        &self,
        key: StockKey,
        quantity: u32,
        reason: &str,
    ) -> Result<StockItem> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity {
                product_id: key.product_id.to_string(),
                quantity,
            });
        }
        let item = self.ledger.receive(&key, quantity, reason).await?;
        tracing::info!(quantity, on_hand = item.quantity, "stock received");
        Ok(item)
    }

    pub async fn stock_level(&self, key: &StockKey) -> Result<Option<StockItem>> {
        self.ledger.item(key).await
    }

    pub async fn stock_for_product(
        &self,
        product_id: &ProductId,
        variant_id: Option<&VariantId>,
    ) -> Result<Vec<StockItem>> {
        self.ledger.items_for_product(product_id, variant_id).await
    }

    /// Reports whether every line could be reserved right now. Holds nothing.
    pub async fn check_stock(&self, lines: &[ReservationLine]) -> Result<StockCheck> {
        let lines = merge_lines(lines)?;
        let mut per_item = Vec::with_capacity(lines.len());

        for line in &lines {
            let candidates = self.candidates(line).await?;
            let available = candidates.iter().map(StockItem::available).max().unwrap_or(0);
            per_item.push(ItemAvailability {
                product_id: line.product_id.clone(),
                variant_id: line.variant_id.clone(),
                requested: line.quantity,
                available,
                ok: available >= i64::from(line.quantity),
            });
        }

        Ok(StockCheck {
            available: per_item.iter().all(|i| i.ok),
            per_item,
        })
    }

    /// Reserves every line for the order, or nothing.
    ///
    /// Reserving again for an order that already holds (or has committed) stock
    /// returns the existing reservations.
    #[tracing::instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn reserve(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        ttl: Option<Duration>,
    ) -> Result<ReservationReceipt> {
        let existing: Vec<_> = self
            .ledger
            .reservations_for_order(order_id)
            .await?
            .into_iter()
            .filter(|r| r.status.holds_stock())
            .collect();
        if !existing.is_empty() {
            return Ok(Self::already_held(order_id, existing));
        }

        let lines = merge_lines(lines)?;
        let expires_at = Utc::now() + ttl.unwrap_or(self.config.default_ttl);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let allocations = match self.allocate(&lines).await {
                Ok(allocations) => allocations,
                Err(err) => return Err(self.reject(order_id, err)),
            };

            match self.ledger.reserve(order_id, &allocations, expires_at).await {
                // A concurrent reserve for the same order got there first.
                Ok(Reserved::Existing(held)) => return Ok(Self::already_held(order_id, held)),
                Ok(Reserved::Created(reservations)) => {
                    metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
                        .increment(1);
                    tracing::info!(
                        %order_id,
                        reservations = reservations.len(),
                        %expires_at,
                        "stock reserved"
                    );
                    return Ok(ReservationReceipt {
                        order_id,
                        reservations,
                        expires_at,
                        created: true,
                    });
                }
                Err(InventoryError::ConcurrencyConflict(key))
                    if attempt <= self.config.conflict_retries =>
                {
                    metrics::counter!("inventory_reservation_conflicts_total").increment(1);
                    tracing::debug!(%order_id, %key, attempt, "lost stock race, re-reading");
                }
                Err(InventoryError::ConcurrencyConflict(key)) => {
                    return Err(self.reject(order_id, InventoryError::Contention(key)));
                }
                Err(err) => return Err(self.reject(order_id, err)),
            }
        }
    }

    fn already_held(order_id: OrderId, reservations: Vec<StockReservation>) -> ReservationReceipt {
        tracing::info!(%order_id, "order already holds reservations");
        let expires_at = reservations
            .iter()
            .map(|r| r.expires_at)
            .max()
            .unwrap_or_else(Utc::now);
        ReservationReceipt {
            order_id,
            reservations,
            expires_at,
            created: false,
        }
    }

    /// Converts the order's Pending reservations into on-hand deductions.
    #[tracing::instrument(skip(self))]
    pub async fn commit(&self, order_id: OrderId) -> Result<OperationOutcome> {
        let committed = self.ledger.commit(order_id).await?;
        if committed.is_empty() {
            tracing::info!(%order_id, "no pending reservations to commit");
        } else {
            metrics::counter!("inventory_commits_total").increment(1);
            tracing::info!(%order_id, reservations = committed.len(), "reservations committed");
        }
        Ok(OperationOutcome::from_count(committed.len()))
    }

    /// Frees the order's Pending reservations. Committed stock is left alone; it
    /// needs [`return_stock`](Self::return_stock).
    pub async fn release(&self, order_id: OrderId, reason: &str) -> Result<OperationOutcome> {
        self.release_reservations(order_id, None, reason).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn release_reservations(
        &self,
        order_id: OrderId,
        reservation_ids: Option<&[ReservationId]>,
        reason: &str,
    ) -> Result<OperationOutcome> {
        let released = self.ledger.release(order_id, reservation_ids, reason).await?;
        if released.is_empty() {
            tracing::info!(%order_id, "no pending reservations to release");
        } else {
            metrics::counter!("inventory_releases_total").increment(released.len() as u64);
            tracing::info!(%order_id, reservations = released.len(), reason, "reservations released");
        }
        Ok(OperationOutcome::from_count(released.len()))
    }

    /// Puts committed stock back on hand. Empty `lines` returns the whole order.
    /// The count in the outcome is in units.
    #[tracing::instrument(skip(self, lines))]
    pub async fn return_stock(
        &self,
        order_id: OrderId,
        lines: &[ReturnLine],
        reason: &str,
    ) -> Result<OperationOutcome> {
        let units = self.ledger.return_committed(order_id, lines, reason).await?;
        if units == 0 {
            tracing::info!(%order_id, "no committed stock left to return");
            return Ok(OperationOutcome::NotFound);
        }
        metrics::counter!("inventory_returns_total").increment(1);
        tracing::info!(%order_id, units, reason, "stock returned");
        Ok(OperationOutcome::Applied { count: units })
    }

    /// One sweep pass: expires Pending reservations past their TTL.
    pub async fn expire_due(&self) -> Result<Vec<StockReservation>> {
        let expired = self
            .ledger
            .expire_due(Utc::now(), self.config.sweep_batch_size)
            .await?;
        if !expired.is_empty() {
            metrics::counter!("inventory_reservations_expired_total")
                .increment(expired.len() as u64);
        }
        for reservation in &expired {
            tracing::info!(
                order_id = %reservation.order_id,
                reservation_id = %reservation.id,
                key = %reservation.key,
                "reservation expired"
            );
        }
        Ok(expired)
    }

    pub async fn reservations(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        self.ledger.reservations_for_order(order_id).await
    }

    pub async fn transactions(&self, order_id: OrderId) -> Result<Vec<InventoryTransaction>> {
        self.ledger.transactions_for_order(order_id).await
    }

    fn reject(&self, order_id: OrderId, err: InventoryError) -> InventoryError {
        let outcome = match &err {
            InventoryError::InsufficientStock(_) => "insufficient",
            InventoryError::Contention(_) => "contention",
            _ => "error",
        };
        metrics::counter!("inventory_reservations_total", "outcome" => outcome).increment(1);
        tracing::info!(%order_id, error = %err, "reservation rejected");
        err
    }

    async fn candidates(&self, line: &ReservationLine) -> Result<Vec<StockItem>> {
        match &line.warehouse_id {
            Some(warehouse_id) => {
                let key = StockKey {
                    product_id: line.product_id.clone(),
                    variant_id: line.variant_id.clone(),
                    warehouse_id: warehouse_id.clone(),
                };
                Ok(self.ledger.item(&key).await?.into_iter().collect())
            }
            None => {
                self.ledger
                    .items_for_product(&line.product_id, line.variant_id.as_ref())
                    .await
            }
        }
    }

    /// Picks a stock item for each line: the pinned one, or the warehouse with the
    /// most available stock that covers the whole line. Reports every line that
    /// cannot be covered.
    async fn allocate(&self, lines: &[ReservationLine]) -> Result<Vec<Allocation>> {
        let mut claimed: HashMap<StockKey, i64> = HashMap::new();
        let mut allocations: Vec<Allocation> = Vec::with_capacity(lines.len());
        let mut shortfalls = Vec::new();

        for line in lines {
            let wanted = i64::from(line.quantity);
            let candidates = self.candidates(line).await?;
            let free = |item: &StockItem| item.available() - claimed.get(&item.key).copied().unwrap_or(0);

            let mut best: Option<&StockItem> = None;
            for item in &candidates {
                if free(item) >= wanted && best.is_none_or(|b| free(item) > free(b)) {
                    best = Some(item);
                }
            }

            match best {
                Some(item) => {
                    let key = item.key.clone();
                    let version = item.version;
                    *claimed.entry(key.clone()).or_default() += wanted;
                    match allocations.iter_mut().find(|a| a.key == key) {
                        Some(existing) => existing.quantity += line.quantity,
                        None => allocations.push(Allocation {
                            key,
                            quantity: line.quantity,
                            expected_version: version,
                        }),
                    }
                }
                None => shortfalls.push(Shortfall {
                    product_id: line.product_id.clone(),
                    variant_id: line.variant_id.clone(),
                    requested: line.quantity,
                    available: candidates.iter().map(free).max().unwrap_or(0).max(0),
                }),
            }
        }

        if shortfalls.is_empty() {
            Ok(allocations)
        } else {
            Err(InventoryError::InsufficientStock(shortfalls))
        }
    }
}

/// Sums lines for the same product, variant and warehouse pin.
fn merge_lines(lines: &[ReservationLine]) -> Result<Vec<ReservationLine>> {
    if lines.is_empty() {
        return Err(InventoryError::NoLines);
    }

    let mut merged: Vec<ReservationLine> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.quantity == 0 {
            return Err(InventoryError::InvalidQuantity {
                product_id: line.product_id.to_string(),
                quantity: line.quantity,
            });
        }
        match merged.iter_mut().find(|m| {
            m.product_id == line.product_id
                && m.variant_id == line.variant_id
                && m.warehouse_id == line.warehouse_id
        }) {
            Some(existing) => existing.quantity += line.quantity,
            None => merged.push(line.clone()),
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::model::{ReservationStatus, TransactionKind};

    fn engine() -> ReservationEngine<InMemoryLedger> {
        ReservationEngine::new(InMemoryLedger::new(), EngineConfig::default())
    }

    async fn stock(engine: &ReservationEngine<InMemoryLedger>, product: &str, wh: &str, qty: u32) {
        engine
            .receive_stock(StockKey::new(product, wh), qty, "initial")
            .await
            .unwrap();
    }

    async fn available(engine: &ReservationEngine<InMemoryLedger>, product: &str, wh: &str) -> i64 {
        engine
            .stock_level(&StockKey::new(product, wh))
            .await
            .unwrap()
            .unwrap()
            .available()
    }

    #[tokio::test]
    async fn reserve_then_commit() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 10).await;
        let order_id = OrderId::new();

        let receipt = engine
            .reserve(order_id, &[ReservationLine::new("SKU-1", 6)], None)
            .await
            .unwrap();
        assert!(receipt.created);
        assert_eq!(available(&engine, "SKU-1", "WH-1").await, 4);

        assert_eq!(
            engine.commit(order_id).await.unwrap(),
            OperationOutcome::Applied { count: 1 }
        );
        let item = engine
            .stock_level(&StockKey::new("SKU-1", "WH-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((item.quantity, item.available()), (4, 4));
        assert_eq!(engine.commit(order_id).await.unwrap(), OperationOutcome::NotFound);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 10).await;
        stock(&engine, "SKU-2", "WH-1", 1).await;

        let result = engine
            .reserve(
                OrderId::new(),
                &[ReservationLine::new("SKU-1", 2), ReservationLine::new("SKU-2", 5)],
                None,
            )
            .await;

        let Err(InventoryError::InsufficientStock(shortfalls)) = result else {
            panic!("expected insufficient stock");
        };
        assert_eq!(shortfalls.len(), 1);
        assert_eq!(shortfalls[0].product_id.as_str(), "SKU-2");
        assert_eq!(shortfalls[0].available, 1);
        assert_eq!(available(&engine, "SKU-1", "WH-1").await, 10);
    }

    #[tokio::test]
    async fn reserve_is_idempotent_per_order() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 10).await;
        let order_id = OrderId::new();
        let lines = [ReservationLine::new("SKU-1", 3)];

        let first = engine.reserve(order_id, &lines, None).await.unwrap();
        let second = engine.reserve(order_id, &lines, None).await.unwrap();

        assert!(!second.created);
        assert_eq!(first.reservation_ids(), second.reservation_ids());
        assert_eq!(available(&engine, "SKU-1", "WH-1").await, 7);
    }

    #[tokio::test]
    async fn duplicate_lines_are_summed_before_checking() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 5).await;

        let result = engine
            .reserve(
                OrderId::new(),
                &[ReservationLine::new("SKU-1", 3), ReservationLine::new("SKU-1", 3)],
                None,
            )
            .await;
        assert!(matches!(result, Err(InventoryError::InsufficientStock(_))));
    }

    #[tokio::test]
    async fn allocation_prefers_warehouse_with_most_stock() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-A", 4).await;
        stock(&engine, "SKU-1", "WH-B", 9).await;

        let receipt = engine
            .reserve(OrderId::new(), &[ReservationLine::new("SKU-1", 3)], None)
            .await
            .unwrap();
        assert_eq!(receipt.reservations[0].key.warehouse_id.as_str(), "WH-B");

        let pinned = engine
            .reserve(
                OrderId::new(),
                &[ReservationLine::new("SKU-1", 2).in_warehouse("WH-A")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(pinned.reservations[0].key.warehouse_id.as_str(), "WH-A");
    }

    #[tokio::test]
    async fn release_is_pending_only_and_idempotent() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 10).await;
        let order_id = OrderId::new();
        engine
            .reserve(order_id, &[ReservationLine::new("SKU-1", 3)], None)
            .await
            .unwrap();

        assert!(engine.release(order_id, "cancelled").await.unwrap().is_applied());
        assert_eq!(
            engine.release(order_id, "cancelled").await.unwrap(),
            OperationOutcome::NotFound
        );
        assert_eq!(available(&engine, "SKU-1", "WH-1").await, 10);
        assert_eq!(engine.commit(order_id).await.unwrap(), OperationOutcome::NotFound);
    }

    #[tokio::test]
    async fn release_by_reservation_id() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 10).await;
        stock(&engine, "SKU-2", "WH-1", 10).await;
        let order_id = OrderId::new();
        let receipt = engine
            .reserve(
                order_id,
                &[ReservationLine::new("SKU-1", 1), ReservationLine::new("SKU-2", 1)],
                None,
            )
            .await
            .unwrap();

        let first = [receipt.reservations[0].id];
        let outcome = engine
            .release_reservations(order_id, Some(&first), "partial")
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Applied { count: 1 });

        let statuses: Vec<_> = engine
            .reservations(order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(
            statuses,
            vec![ReservationStatus::Released, ReservationStatus::Pending]
        );
    }

    #[tokio::test]
    async fn return_stock_never_exceeds_committed() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 10).await;
        let order_id = OrderId::new();
        engine
            .reserve(order_id, &[ReservationLine::new("SKU-1", 4)], None)
            .await
            .unwrap();
        engine.commit(order_id).await.unwrap();

        let lines = [ReturnLine {
            product_id: "SKU-1".into(),
            variant_id: None,
            quantity: 3,
        }];
        assert_eq!(
            engine.return_stock(order_id, &lines, "refund").await.unwrap(),
            OperationOutcome::Applied { count: 3 }
        );
        assert_eq!(
            engine.return_stock(order_id, &lines, "refund").await.unwrap(),
            OperationOutcome::Applied { count: 1 }
        );
        assert_eq!(
            engine.return_stock(order_id, &[], "refund").await.unwrap(),
            OperationOutcome::NotFound
        );
        assert_eq!(available(&engine, "SKU-1", "WH-1").await, 10);

        let kinds: Vec<_> = engine
            .transactions(order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TransactionKind::Reservation,
                TransactionKind::Commit,
                TransactionKind::Return,
                TransactionKind::Return
            ]
        );
    }

    #[tokio::test]
    async fn expired_reservations_restore_availability() {
        let engine = ReservationEngine::new(
            InMemoryLedger::new(),
            EngineConfig::default().with_ttl(Duration::milliseconds(1)),
        );
        stock(&engine, "SKU-1", "WH-1", 10).await;
        let order_id = OrderId::new();
        engine
            .reserve(order_id, &[ReservationLine::new("SKU-1", 6)], None)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let expired = engine.expire_due().await.unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, ReservationStatus::Expired);
        assert_eq!(available(&engine, "SKU-1", "WH-1").await, 10);
        assert_eq!(engine.commit(order_id).await.unwrap(), OperationOutcome::NotFound);
    }

    #[tokio::test]
    async fn check_stock_reports_per_item() {
        let engine = engine();
        stock(&engine, "SKU-1", "WH-1", 5).await;

        let check = engine
            .check_stock(&[ReservationLine::new("SKU-1", 5), ReservationLine::new("SKU-9", 1)])
            .await
            .unwrap();

        assert!(!check.available);
        assert!(check.per_item[0].ok);
        assert!(!check.per_item[1].ok);
        assert_eq!(check.per_item[1].available, 0);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.reserve(OrderId::new(), &[], None).await,
            Err(InventoryError::NoLines)
        ));
        assert!(matches!(
            engine
                .reserve(OrderId::new(), &[ReservationLine::new("SKU-1", 0)], None)
                .await,
            Err(InventoryError::InvalidQuantity { .. })
        ));
        assert!(matches!(
            engine
                .receive_stock(StockKey::new("SKU-1", "WH-1"), 0, "nothing")
                .await,
            Err(InventoryError::InvalidQuantity { .. })
        ));
    }
}
