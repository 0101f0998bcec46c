//! Stock ledger records.

use std::fmt;

use chrono::{DateTime, Utc};
use common::ReservationId;
use domain::{OrderId, OrderLine, ProductId, VariantId, WarehouseId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Natural key of a stock item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockKey {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: WarehouseId,
}

impl StockKey {
    pub fn new(product_id: impl Into<ProductId>, warehouse_id: impl Into<WarehouseId>) -> Self {
        Self {
            product_id: product_id.into(),
            variant_id: None,
            warehouse_id: warehouse_id.into(),
        }
    }

    pub fn with_variant(mut self, variant_id: impl Into<VariantId>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    /// Same product and variant, any warehouse.
    pub fn is_product(&self, product_id: &ProductId, variant_id: Option<&VariantId>) -> bool {
        &self.product_id == product_id && self.variant_id.as_ref() == variant_id
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant_id {
            Some(variant) => write!(f, "{}/{}@{}", self.product_id, variant, self.warehouse_id),
            None => write!(f, "{}@{}", self.product_id, self.warehouse_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockItem {
    pub key: StockKey,
    /// On hand. Only commit and return change it after receipt.
    pub quantity: i64,
    /// Held by Pending reservations.
    pub reserved_quantity: i64,
    /// Bumped on every change; reservations write against the version they read.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl StockItem {
    pub fn new(key: StockKey) -> Self {
        Self {
            key,
            quantity: 0,
            reserved_quantity: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn available(&self) -> i64 {
        self.quantity - self.reserved_quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    /// Pending and Committed reservations count against the order; a fresh
    /// reserve for it is a repeat.
    pub fn holds_stock(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Committed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "Pending",
            ReservationStatus::Committed => "Committed",
            ReservationStatus::Released => "Released",
            ReservationStatus::Expired => "Expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(ReservationStatus::Pending),
            "Committed" => Some(ReservationStatus::Committed),
            "Released" => Some(ReservationStatus::Released),
            "Expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hold on one stock item for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservation {
    pub id: ReservationId,
    pub order_id: OrderId,
    pub key: StockKey,
    pub quantity: u32,
    /// Units put back on hand after the reservation was committed.
    pub returned_quantity: u32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockReservation {
    pub fn new(order_id: OrderId, key: StockKey, quantity: u32, expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: ReservationId::new(),
            order_id,
            key,
            quantity,
            returned_quantity: 0,
            status: ReservationStatus::Pending,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Committed units not yet returned.
    pub fn returnable(&self) -> u32 {
        match self.status {
            ReservationStatus::Committed => self.quantity - self.returned_quantity,
            _ => 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && self.expires_at < now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Receipt,
    Reservation,
    Commit,
    Release,
    Expiration,
    Return,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Receipt => "Receipt",
            TransactionKind::Reservation => "Reservation",
            TransactionKind::Commit => "Commit",
            TransactionKind::Release => "Release",
            TransactionKind::Expiration => "Expiration",
            TransactionKind::Return => "Return",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Receipt" => Some(TransactionKind::Receipt),
            "Reservation" => Some(TransactionKind::Reservation),
            "Commit" => Some(TransactionKind::Commit),
            "Release" => Some(TransactionKind::Release),
            "Expiration" => Some(TransactionKind::Expiration),
            "Return" => Some(TransactionKind::Return),
            _ => None,
        }
    }

    /// `(quantity delta, reserved delta)` for `units` of this kind.
    pub fn deltas(&self, units: u32) -> (i64, i64) {
        let units = i64::from(units);
        match self {
            TransactionKind::Receipt | TransactionKind::Return => (units, 0),
            TransactionKind::Reservation => (0, units),
            TransactionKind::Commit => (-units, -units),
            TransactionKind::Release | TransactionKind::Expiration => (0, -units),
        }
    }
}

/// Append-only audit record of one change to a stock item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryTransaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub key: StockKey,
    pub quantity_delta: i64,
    pub reserved_delta: i64,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub reserved_before: i64,
    pub reserved_after: i64,
    pub order_id: Option<OrderId>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl InventoryTransaction {
    /// Records the change from `before` to `after`.
    pub fn record(
        kind: TransactionKind,
        before: &StockItem,
        after: &StockItem,
        order_id: Option<OrderId>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            key: after.key.clone(),
            quantity_delta: after.quantity - before.quantity,
            reserved_delta: after.reserved_quantity - before.reserved_quantity,
            quantity_before: before.quantity,
            quantity_after: after.quantity,
            reserved_before: before.reserved_quantity,
            reserved_after: after.reserved_quantity,
            order_id,
            reason: reason.into(),
            created_at: after.updated_at,
        }
    }
}

/// One requested line. Without a warehouse the engine picks one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: Option<WarehouseId>,
    pub quantity: u32,
}

impl ReservationLine {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            variant_id: None,
            warehouse_id: None,
            quantity,
        }
    }

    pub fn with_variant(mut self, variant_id: impl Into<VariantId>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    pub fn in_warehouse(mut self, warehouse_id: impl Into<WarehouseId>) -> Self {
        self.warehouse_id = Some(warehouse_id.into());
        self
    }
}

impl From<&OrderLine> for ReservationLine {
    fn from(line: &OrderLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            variant_id: line.variant_id.clone(),
            warehouse_id: line.warehouse_id.clone(),
            quantity: line.quantity,
        }
    }
}

/// Units to put back on hand for an already committed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
}

/// A line the ledger could not cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shortfall {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub requested: u32,
    /// Best single-warehouse availability.
    pub available: i64,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.product_id)?;
        if let Some(variant) = &self.variant_id {
            write!(f, "/{variant}")?;
        }
        write!(f, " requested {}, available {}", self.requested, self.available)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAvailability {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub requested: u32,
    pub available: i64,
    pub ok: bool,
}

/// Answer to a stock check. Nothing is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockCheck {
    pub available: bool,
    pub per_item: Vec<ItemAvailability>,
}

/// A stock item and the units to hold on it, tagged with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub key: StockKey,
    pub quantity: u32,
    pub expected_version: i64,
}

/// What a ledger `reserve` did for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reserved {
    Created(Vec<StockReservation>),
    /// The order already held stock. Nothing changed.
    Existing(Vec<StockReservation>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationReceipt {
    pub order_id: OrderId,
    pub reservations: Vec<StockReservation>,
    pub expires_at: DateTime<Utc>,
    /// False when the order already held these reservations.
    pub created: bool,
}

impl ReservationReceipt {
    pub fn reservation_ids(&self) -> Vec<ReservationId> {
        self.reservations.iter().map(|r| r.id).collect()
    }
}

/// Result of an operation that may legitimately find nothing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum OperationOutcome {
    /// `count` reservations (or, for returns, units) changed.
    Applied { count: u32 },
    NotFound,
}

impl OperationOutcome {
    pub fn from_count(count: usize) -> Self {
        match count {
            0 => OperationOutcome::NotFound,
            n => OperationOutcome::Applied {
                count: u32::try_from(n).unwrap_or(u32::MAX),
            },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, OperationOutcome::Applied { .. })
    }
}
