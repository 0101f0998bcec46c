//! Discount and usage storage.

mod memory;
mod postgres;

pub use memory::InMemoryDiscountStore;
pub use postgres::PostgresDiscountStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DiscountId, UserId};
use domain::OrderId;

use crate::Result;
use crate::model::{Discount, DiscountUsage, RecordOutcome, RollbackOutcome};

#[async_trait]
pub trait DiscountStore: Send + Sync + 'static {
    /// Fails with `DuplicateCode` when the normalized code is taken.
    async fn insert_discount(&self, discount: &Discount) -> Result<()>;

    async fn discount(&self, id: DiscountId) -> Result<Option<Discount>>;

    /// `code` must already be normalized.
    async fn discount_by_code(&self, code: &str) -> Result<Option<Discount>>;

    /// Active usages of the discount by the user.
    async fn active_usages_by_user(&self, discount_id: DiscountId, user_id: UserId)
    -> Result<u32>;

    /// Inserts the usage unless the order already has one.
    ///
    /// The global and per-user caps are checked in the same atomic step as the
    /// insert, so two orders racing for the last use cannot both get it.
    async fn record_usage(&self, usage: DiscountUsage) -> Result<RecordOutcome>;

    /// Flips the order's active usage to RolledBack and gives the use back.
    async fn rollback_usage(&self, order_id: OrderId, now: DateTime<Utc>)
    -> Result<RollbackOutcome>;

    async fn usage_for_order(&self, order_id: OrderId) -> Result<Option<DiscountUsage>>;

    async fn usages_for_discount(&self, discount_id: DiscountId) -> Result<Vec<DiscountUsage>>;
}
