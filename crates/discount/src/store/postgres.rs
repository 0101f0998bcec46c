use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DiscountId, UserId};
use domain::{Money, OrderId, ProductId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::DiscountStore;
use crate::model::{
    Discount, DiscountKind, DiscountUsage, LimitScope, RecordOutcome, RollbackOutcome,
    UsageStatus,
};
use crate::{DiscountError, Result};

const DISCOUNT_COLUMNS: &str = "id, code, name, kind, minimum_order_cents, \
     maximum_discount_cents, usage_limit, usage_limit_per_user, times_used, starts_at, ends_at, \
     is_active, applicable_product_ids, created_at";

const USAGE_COLUMNS: &str = "id, discount_id, user_id, order_id, order_cents, discount_cents, \
     status, used_at, rolled_back_at";

/// PostgreSQL-backed discount store.
///
/// Usage recording locks the discount row, so concurrent recorders of the same
/// discount are serialized; `UNIQUE (order_id)` on usages is the final guard against
/// recording an order twice.
#[derive(Clone)]
pub struct PostgresDiscountStore {
    pool: PgPool,
}

impl PostgresDiscountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn count(value: Option<i32>, column: &str) -> Result<Option<u32>> {
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| DiscountError::CorruptRow(format!("{column} = {v}")))
        })
        .transpose()
}

fn to_column(value: Option<u32>) -> Option<i32> {
    value.map(|v| i32::try_from(v).unwrap_or(i32::MAX))
}

fn row_to_discount(row: PgRow) -> Result<Discount> {
    let kind: serde_json::Value = row.try_get("kind")?;
    let kind: DiscountKind = serde_json::from_value(kind)
        .map_err(|e| DiscountError::CorruptRow(format!("kind: {e}")))?;
    let products: Vec<String> = row.try_get("applicable_product_ids")?;

    Ok(Discount {
        id: DiscountId::from_uuid(row.try_get::<Uuid, _>("id")?),
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        kind,
        minimum_order_amount: row
            .try_get::<Option<i64>, _>("minimum_order_cents")?
            .map(Money::from_cents),
        maximum_discount_amount: row
            .try_get::<Option<i64>, _>("maximum_discount_cents")?
            .map(Money::from_cents),
        usage_limit: count(row.try_get("usage_limit")?, "usage_limit")?,
        usage_limit_per_user: count(row.try_get("usage_limit_per_user")?, "usage_limit_per_user")?,
        times_used: count(Some(row.try_get("times_used")?), "times_used")?.unwrap_or(0),
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        is_active: row.try_get("is_active")?,
        applicable_product_ids: products.into_iter().map(ProductId::new).collect(),
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_usage(row: PgRow) -> Result<DiscountUsage> {
    let status: String = row.try_get("status")?;
    Ok(DiscountUsage {
        id: row.try_get("id")?,
        discount_id: DiscountId::from_uuid(row.try_get::<Uuid, _>("discount_id")?),
        user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
        order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
        order_amount: Money::from_cents(row.try_get("order_cents")?),
        discount_amount: Money::from_cents(row.try_get("discount_cents")?),
        status: UsageStatus::parse(&status)
            .ok_or_else(|| DiscountError::CorruptRow(format!("status = {status}")))?,
        used_at: row.try_get("used_at")?,
        rolled_back_at: row.try_get("rolled_back_at")?,
    })
}

#[async_trait]
impl DiscountStore for PostgresDiscountStore {
    async fn insert_discount(&self, discount: &Discount) -> Result<()> {
        let kind = serde_json::to_value(discount.kind)
            .map_err(|e| DiscountError::InvalidDiscount(e.to_string()))?;
        let products: Vec<String> = discount
            .applicable_product_ids
            .iter()
            .map(ToString::to_string)
            .collect();

        let result = sqlx::query(
            r#"
            INSERT INTO discounts
                (id, code, name, kind, minimum_order_cents, maximum_discount_cents, usage_limit,
                 usage_limit_per_user, times_used, starts_at, ends_at, is_active,
                 applicable_product_ids, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(discount.id.as_uuid())
        .bind(&discount.code)
        .bind(&discount.name)
        .bind(kind)
        .bind(discount.minimum_order_amount.map(|m| m.cents()))
        .bind(discount.maximum_discount_amount.map(|m| m.cents()))
        .bind(to_column(discount.usage_limit))
        .bind(to_column(discount.usage_limit_per_user))
        .bind(to_column(Some(discount.times_used)))
        .bind(discount.starts_at)
        .bind(discount.ends_at)
        .bind(discount.is_active)
        .bind(products)
        .bind(discount.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(DiscountError::DuplicateCode(discount.code.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn discount(&self, id: DiscountId) -> Result<Option<Discount>> {
        sqlx::query(&format!("SELECT {DISCOUNT_COLUMNS} FROM discounts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_discount)
            .transpose()
    }

    async fn discount_by_code(&self, code: &str) -> Result<Option<Discount>> {
        sqlx::query(&format!("SELECT {DISCOUNT_COLUMNS} FROM discounts WHERE code = $1"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_discount)
            .transpose()
    }

    async fn active_usages_by_user(
        &self,
        discount_id: DiscountId,
        user_id: UserId,
    ) -> Result<u32> {
        let used: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM discount_usages \
             WHERE discount_id = $1 AND user_id = $2 AND status = 'Active'",
        )
        .bind(discount_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(used).unwrap_or(u32::MAX))
    }

    async fn record_usage(&self, usage: DiscountUsage) -> Result<RecordOutcome> {
        let mut tx = self.pool.begin().await?;

        // Lock the discount first so every recorder of it queues here.
        let Some(row) = sqlx::query(
            "SELECT usage_limit, usage_limit_per_user, times_used FROM discounts \
             WHERE id = $1 FOR UPDATE",
        )
        .bind(usage.discount_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Err(DiscountError::DiscountNotFound(usage.discount_id));
        };

        if let Some(existing) =
            sqlx::query(&format!("SELECT {USAGE_COLUMNS} FROM discount_usages WHERE order_id = $1"))
                .bind(usage.order_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
        {
            return Ok(RecordOutcome::AlreadyRecorded(row_to_usage(existing)?));
        }

        let usage_limit: Option<i32> = row.try_get("usage_limit")?;
        let per_user: Option<i32> = row.try_get("usage_limit_per_user")?;
        let times_used: i32 = row.try_get("times_used")?;
        if usage_limit.is_some_and(|limit| times_used >= limit) {
            return Ok(RecordOutcome::UsageLimitExceeded(LimitScope::Global));
        }
        if let Some(limit) = per_user {
            let used: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM discount_usages \
                 WHERE discount_id = $1 AND user_id = $2 AND status = 'Active'",
            )
            .bind(usage.discount_id.as_uuid())
            .bind(usage.user_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;
            if used >= i64::from(limit) {
                return Ok(RecordOutcome::UsageLimitExceeded(LimitScope::PerUser));
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO discount_usages
                (id, discount_id, user_id, order_id, order_cents, discount_cents, status, used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(usage.id)
        .bind(usage.discount_id.as_uuid())
        .bind(usage.user_id.as_uuid())
        .bind(usage.order_id.as_uuid())
        .bind(usage.order_amount.cents())
        .bind(usage.discount_amount.cents())
        .bind(usage.status.as_str())
        .bind(usage.used_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Same order recorded against another discount in the meantime.
            tx.rollback().await?;
            return match self.usage_for_order(usage.order_id).await? {
                Some(existing) => Ok(RecordOutcome::AlreadyRecorded(existing)),
                None => Err(DiscountError::CorruptRow(format!(
                    "usage for order {} vanished",
                    usage.order_id
                ))),
            };
        }

        sqlx::query("UPDATE discounts SET times_used = times_used + 1 WHERE id = $1")
            .bind(usage.discount_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RecordOutcome::Recorded(usage))
    }

    async fn rollback_usage(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<RollbackOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query(&format!(
            "UPDATE discount_usages SET status = 'RolledBack', rolled_back_at = $2 \
             WHERE order_id = $1 AND status = 'Active' RETURNING {USAGE_COLUMNS}"
        ))
        .bind(order_id.as_uuid())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(RollbackOutcome::NotFound);
        };
        let usage = row_to_usage(row)?;

        sqlx::query(
            "UPDATE discounts SET times_used = GREATEST(times_used - 1, 0) WHERE id = $1",
        )
        .bind(usage.discount_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RollbackOutcome::RolledBack(usage))
    }

    async fn usage_for_order(&self, order_id: OrderId) -> Result<Option<DiscountUsage>> {
        sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS} FROM discount_usages WHERE order_id = $1"
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(row_to_usage)
        .transpose()
    }

    async fn usages_for_discount(&self, discount_id: DiscountId) -> Result<Vec<DiscountUsage>> {
        sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS} FROM discount_usages WHERE discount_id = $1 ORDER BY used_at"
        ))
        .bind(discount_id.as_uuid())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(row_to_usage)
        .collect()
    }
}
