use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ReservationId;
use domain::{OrderId, ProductId, VariantId, WarehouseId};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{StockLedger, plan_returns};
use crate::model::{
    Allocation, InventoryTransaction, ReservationStatus, Reserved, ReturnLine, Shortfall,
    StockItem, StockKey, StockReservation, TransactionKind,
};
use crate::{InventoryError, Result};

const ITEM_COLUMNS: &str =
    "product_id, variant_id, warehouse_id, quantity, reserved_quantity, version, updated_at";

const RESERVATION_COLUMNS: &str = "id, order_id, product_id, variant_id, warehouse_id, quantity, \
     returned_quantity, status, expires_at, created_at, updated_at";

/// PostgreSQL-backed stock ledger.
///
/// Availability checks are folded into conditional `UPDATE`s, so the row lock taken by
/// the update is what serializes concurrent reservations of the same item.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// The table uses '' for "no variant" so the key fits a primary key.
fn variant_column(variant_id: Option<&VariantId>) -> &str {
    variant_id.map(VariantId::as_str).unwrap_or("")
}

fn variant_from_column(value: String) -> Option<VariantId> {
    (!value.is_empty()).then(|| VariantId::new(value))
}

fn units(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| InventoryError::CorruptRow(format!("{column} = {value}")))
}

fn row_to_key(row: &PgRow) -> Result<StockKey> {
    Ok(StockKey {
        product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
        variant_id: variant_from_column(row.try_get("variant_id")?),
        warehouse_id: WarehouseId::new(row.try_get::<String, _>("warehouse_id")?),
    })
}

fn row_to_item(row: PgRow) -> Result<StockItem> {
    Ok(StockItem {
        key: row_to_key(&row)?,
        quantity: row.try_get("quantity")?,
        reserved_quantity: row.try_get("reserved_quantity")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_reservation(row: PgRow) -> Result<StockReservation> {
    let status: String = row.try_get("status")?;
    Ok(StockReservation {
        id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
        order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
        key: row_to_key(&row)?,
        quantity: units(row.try_get("quantity")?, "quantity")?,
        returned_quantity: units(row.try_get("returned_quantity")?, "returned_quantity")?,
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| InventoryError::CorruptRow(format!("status = {status}")))?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_transaction(row: PgRow) -> Result<InventoryTransaction> {
    let kind: String = row.try_get("kind")?;
    Ok(InventoryTransaction {
        id: row.try_get("id")?,
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| InventoryError::CorruptRow(format!("kind = {kind}")))?,
        key: row_to_key(&row)?,
        quantity_delta: row.try_get("quantity_delta")?,
        reserved_delta: row.try_get("reserved_delta")?,
        quantity_before: row.try_get("quantity_before")?,
        quantity_after: row.try_get("quantity_after")?,
        reserved_before: row.try_get("reserved_before")?,
        reserved_after: row.try_get("reserved_after")?,
        order_id: row
            .try_get::<Option<Uuid>, _>("order_id")?
            .map(OrderId::from_uuid),
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_transaction(conn: &mut PgConnection, record: &InventoryTransaction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO inventory_transactions
            (id, kind, product_id, variant_id, warehouse_id, quantity_delta, reserved_delta,
             quantity_before, quantity_after, reserved_before, reserved_after, order_id, reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(record.id)
    .bind(record.kind.as_str())
    .bind(record.key.product_id.as_str())
    .bind(variant_column(record.key.variant_id.as_ref()))
    .bind(record.key.warehouse_id.as_str())
    .bind(record.quantity_delta)
    .bind(record.reserved_delta)
    .bind(record.quantity_before)
    .bind(record.quantity_after)
    .bind(record.reserved_before)
    .bind(record.reserved_after)
    .bind(record.order_id.map(|id| id.as_uuid()))
    .bind(&record.reason)
    .bind(record.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Applies `kind` to an existing item and records the audit row.
async fn adjust_item(
    conn: &mut PgConnection,
    key: &StockKey,
    kind: TransactionKind,
    quantity: u32,
    order_id: Option<OrderId>,
    reason: &str,
) -> Result<StockItem> {
    let (quantity_delta, reserved_delta) = kind.deltas(quantity);
    let row = sqlx::query(&format!(
        r#"
        UPDATE stock_items
        SET quantity = quantity + $4,
            reserved_quantity = reserved_quantity + $5,
            version = version + 1,
            updated_at = now()
        WHERE product_id = $1 AND variant_id = $2 AND warehouse_id = $3
        RETURNING {ITEM_COLUMNS}
        "#
    ))
    .bind(key.product_id.as_str())
    .bind(variant_column(key.variant_id.as_ref()))
    .bind(key.warehouse_id.as_str())
    .bind(quantity_delta)
    .bind(reserved_delta)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| InventoryError::StockItemNotFound(key.clone()))?;

    let after = row_to_item(row)?;
    let before = StockItem {
        quantity: after.quantity - quantity_delta,
        reserved_quantity: after.reserved_quantity - reserved_delta,
        version: after.version - 1,
        ..after.clone()
    };
    insert_transaction(conn, &InventoryTransaction::record(kind, &before, &after, order_id, reason))
        .await?;
    Ok(after)
}

/// Applies the stock side of moving reservations out of Pending.
async fn settle_items(
    conn: &mut PgConnection,
    reservations: &[StockReservation],
    kind: TransactionKind,
    reason: &str,
) -> Result<()> {
    for reservation in reservations {
        adjust_item(
            conn,
            &reservation.key,
            kind,
            reservation.quantity,
            Some(reservation.order_id),
            reason,
        )
        .await?;
    }
    Ok(())
}

#[async_trait]
impl StockLedger for PostgresLedger {
    async fn receive(&self, key: &StockKey, quantity: u32, reason: &str) -> Result<StockItem> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO stock_items (product_id, variant_id, warehouse_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (product_id, variant_id, warehouse_id) DO NOTHING
            "#,
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key.variant_id.as_ref()))
        .bind(key.warehouse_id.as_str())
        .execute(&mut *tx)
        .await?;

        let item = adjust_item(&mut tx, key, TransactionKind::Receipt, quantity, None, reason).await?;
        tx.commit().await?;
        Ok(item)
    }

    async fn item(&self, key: &StockKey) -> Result<Option<StockItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM stock_items \
             WHERE product_id = $1 AND variant_id = $2 AND warehouse_id = $3"
        ))
        .bind(key.product_id.as_str())
        .bind(variant_column(key.variant_id.as_ref()))
        .bind(key.warehouse_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_item).transpose()
    }

    async fn items_for_product(
        &self,
        product_id: &ProductId,
        variant_id: Option<&VariantId>,
    ) -> Result<Vec<StockItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM stock_items \
             WHERE product_id = $1 AND variant_id = $2 ORDER BY warehouse_id"
        ))
        .bind(product_id.as_str())
        .bind(variant_column(variant_id))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_item).collect()
    }

    async fn reserve(
        &self,
        order_id: OrderId,
        allocations: &[Allocation],
        expires_at: DateTime<Utc>,
    ) -> Result<Reserved> {
        let mut tx = self.pool.begin().await?;

        // Serializes reserves for one order until commit; the read below then sees
        // whatever an earlier reserve for it committed.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::uuid::text, 0))")
            .bind(order_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        let held = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE order_id = $1 AND status IN ('Pending', 'Committed') \
             ORDER BY created_at, id"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(row_to_reservation)
        .collect::<Result<Vec<_>>>()?;
        if !held.is_empty() {
            tx.rollback().await?;
            return Ok(Reserved::Existing(held));
        }

        let mut created = Vec::with_capacity(allocations.len());

        for allocation in allocations {
            let key = &allocation.key;
            let quantity = i64::from(allocation.quantity);

            let updated = sqlx::query(&format!(
                r#"
                UPDATE stock_items
                SET reserved_quantity = reserved_quantity + $4,
                    version = version + 1,
                    updated_at = now()
                WHERE product_id = $1 AND variant_id = $2 AND warehouse_id = $3
                  AND version = $5
                  AND quantity - reserved_quantity >= $4
                RETURNING {ITEM_COLUMNS}
                "#
            ))
            .bind(key.product_id.as_str())
            .bind(variant_column(key.variant_id.as_ref()))
            .bind(key.warehouse_id.as_str())
            .bind(quantity)
            .bind(allocation.expected_version)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = updated else {
                // Nothing matched: find out why. Dropping `tx` rolls back earlier lines.
                let current = sqlx::query(&format!(
                    "SELECT {ITEM_COLUMNS} FROM stock_items \
                     WHERE product_id = $1 AND variant_id = $2 AND warehouse_id = $3"
                ))
                .bind(key.product_id.as_str())
                .bind(variant_column(key.variant_id.as_ref()))
                .bind(key.warehouse_id.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .map(row_to_item)
                .transpose()?;

                return Err(match current {
                    None => InventoryError::StockItemNotFound(key.clone()),
                    Some(item) if item.available() < quantity => {
                        InventoryError::InsufficientStock(vec![Shortfall {
                            product_id: key.product_id.clone(),
                            variant_id: key.variant_id.clone(),
                            requested: allocation.quantity,
                            available: item.available(),
                        }])
                    }
                    Some(_) => InventoryError::ConcurrencyConflict(key.clone()),
                });
            };

            let after = row_to_item(row)?;
            let before = StockItem {
                reserved_quantity: after.reserved_quantity - quantity,
                version: after.version - 1,
                ..after.clone()
            };
            insert_transaction(
                &mut tx,
                &InventoryTransaction::record(
                    TransactionKind::Reservation,
                    &before,
                    &after,
                    Some(order_id),
                    "reserved for order",
                ),
            )
            .await?;

            let reservation =
                StockReservation::new(order_id, key.clone(), allocation.quantity, expires_at);
            sqlx::query(
                r#"
                INSERT INTO stock_reservations
                    (id, order_id, product_id, variant_id, warehouse_id, quantity,
                     returned_quantity, status, expires_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, $10)
                "#,
            )
            .bind(reservation.id.as_uuid())
            .bind(order_id.as_uuid())
            .bind(key.product_id.as_str())
            .bind(variant_column(key.variant_id.as_ref()))
            .bind(key.warehouse_id.as_str())
            .bind(quantity)
            .bind(reservation.status.as_str())
            .bind(reservation.expires_at)
            .bind(reservation.created_at)
            .bind(reservation.updated_at)
            .execute(&mut *tx)
            .await?;

            created.push(reservation);
        }

        tx.commit().await?;
        Ok(Reserved::Created(created))
    }

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE order_id = $1 ORDER BY created_at, id"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_reservation).collect()
    }

    async fn commit(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        let mut tx = self.pool.begin().await?;

        // Only rows still Pending move; a concurrent sweep or release wins or loses here.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE stock_reservations
            SET status = 'Committed', updated_at = now()
            WHERE order_id = $1 AND status = 'Pending'
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;
        let committed = rows
            .into_iter()
            .map(row_to_reservation)
            .collect::<Result<Vec<_>>>()?;

        settle_items(&mut tx, &committed, TransactionKind::Commit, "payment confirmed").await?;
        tx.commit().await?;
        Ok(committed)
    }

    async fn release(
        &self,
        order_id: OrderId,
        reservation_ids: Option<&[ReservationId]>,
        reason: &str,
    ) -> Result<Vec<StockReservation>> {
        let ids: Option<Vec<Uuid>> =
            reservation_ids.map(|ids| ids.iter().map(|id| id.as_uuid()).collect());
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE stock_reservations
            SET status = 'Released', updated_at = now()
            WHERE order_id = $1 AND status = 'Pending'
              AND ($2::uuid[] IS NULL OR id = ANY($2))
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(order_id.as_uuid())
        .bind(ids)
        .fetch_all(&mut *tx)
        .await?;
        let released = rows
            .into_iter()
            .map(row_to_reservation)
            .collect::<Result<Vec<_>>>()?;

        settle_items(&mut tx, &released, TransactionKind::Release, reason).await?;
        tx.commit().await?;
        Ok(released)
    }

    async fn return_committed(
        &self,
        order_id: OrderId,
        lines: &[ReturnLine],
        reason: &str,
    ) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE order_id = $1 ORDER BY created_at, id FOR UPDATE"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;
        let reservations = rows
            .into_iter()
            .map(row_to_reservation)
            .collect::<Result<Vec<_>>>()?;

        let mut returned = 0;
        for (idx, quantity) in plan_returns(&reservations, lines) {
            let reservation = &reservations[idx];
            sqlx::query(
                "UPDATE stock_reservations \
                 SET returned_quantity = returned_quantity + $2, updated_at = now() WHERE id = $1",
            )
            .bind(reservation.id.as_uuid())
            .bind(i64::from(quantity))
            .execute(&mut *tx)
            .await?;

            adjust_item(
                &mut tx,
                &reservation.key,
                TransactionKind::Return,
                quantity,
                Some(order_id),
                reason,
            )
            .await?;
            returned += quantity;
        }

        tx.commit().await?;
        Ok(returned)
    }

    async fn expire_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<StockReservation>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE stock_reservations
            SET status = 'Expired', updated_at = now()
            WHERE id IN (
                SELECT id FROM stock_reservations
                WHERE status = 'Pending' AND expires_at < $1
                ORDER BY expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'Pending'
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;
        let expired = rows
            .into_iter()
            .map(row_to_reservation)
            .collect::<Result<Vec<_>>>()?;

        settle_items(
            &mut tx,
            &expired,
            TransactionKind::Expiration,
            "reservation expired",
        )
        .await?;
        tx.commit().await?;
        Ok(expired)
    }

    async fn transactions_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<InventoryTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, product_id, variant_id, warehouse_id, quantity_delta, reserved_delta,
                   quantity_before, quantity_after, reserved_before, reserved_after,
                   order_id, reason, created_at
            FROM inventory_transactions
            WHERE order_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_transaction).collect()
    }
}
