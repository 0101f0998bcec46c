use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DiscountId, UserId};
use domain::OrderId;
use tokio::sync::RwLock;

use super::DiscountStore;
use crate::model::{
    Discount, DiscountUsage, LimitScope, RecordOutcome, RollbackOutcome, UsageStatus,
};
use crate::{DiscountError, Result};

#[derive(Default)]
struct State {
    discounts: HashMap<DiscountId, Discount>,
    codes: HashMap<String, DiscountId>,
    usages: Vec<DiscountUsage>,
    by_order: HashMap<OrderId, usize>,
}

impl State {
    fn active_by_user(&self, discount_id: DiscountId, user_id: UserId) -> u32 {
        let count = self
            .usages
            .iter()
            .filter(|u| {
                u.discount_id == discount_id
                    && u.user_id == user_id
                    && u.status == UsageStatus::Active
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

/// In-memory discount store. One write lock covers cap checks and inserts.
#[derive(Clone, Default)]
pub struct InMemoryDiscountStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryDiscountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscountStore for InMemoryDiscountStore {
    async fn insert_discount(&self, discount: &Discount) -> Result<()> {
        let mut state = self.state.write().await;
        if state.codes.contains_key(&discount.code) {
            return Err(DiscountError::DuplicateCode(discount.code.clone()));
        }
        state.codes.insert(discount.code.clone(), discount.id);
        state.discounts.insert(discount.id, discount.clone());
        Ok(())
    }

    async fn discount(&self, id: DiscountId) -> Result<Option<Discount>> {
        Ok(self.state.read().await.discounts.get(&id).cloned())
    }

    async fn discount_by_code(&self, code: &str) -> Result<Option<Discount>> {
        let state = self.state.read().await;
        Ok(state
            .codes
            .get(code)
            .and_then(|id| state.discounts.get(id))
            .cloned())
    }

    async fn active_usages_by_user(
        &self,
        discount_id: DiscountId,
        user_id: UserId,
    ) -> Result<u32> {
        Ok(self.state.read().await.active_by_user(discount_id, user_id))
    }

    async fn record_usage(&self, usage: DiscountUsage) -> Result<RecordOutcome> {
        let mut state = self.state.write().await;

        if let Some(&idx) = state.by_order.get(&usage.order_id) {
            return Ok(RecordOutcome::AlreadyRecorded(state.usages[idx].clone()));
        }

        let by_user = state.active_by_user(usage.discount_id, usage.user_id);
        let discount = state
            .discounts
            .get(&usage.discount_id)
            .ok_or(DiscountError::DiscountNotFound(usage.discount_id))?;
        if discount.usage_limit_reached() {
            return Ok(RecordOutcome::UsageLimitExceeded(LimitScope::Global));
        }
        if discount
            .usage_limit_per_user
            .is_some_and(|limit| by_user >= limit)
        {
            return Ok(RecordOutcome::UsageLimitExceeded(LimitScope::PerUser));
        }

        if let Some(discount) = state.discounts.get_mut(&usage.discount_id) {
            discount.times_used += 1;
        }
        let idx = state.usages.len();
        state.by_order.insert(usage.order_id, idx);
        state.usages.push(usage.clone());
        Ok(RecordOutcome::Recorded(usage))
    }

    async fn rollback_usage(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<RollbackOutcome> {
        let mut state = self.state.write().await;
        let Some(&idx) = state.by_order.get(&order_id) else {
            return Ok(RollbackOutcome::NotFound);
        };
        if state.usages[idx].status != UsageStatus::Active {
            return Ok(RollbackOutcome::NotFound);
        }

        let usage = &mut state.usages[idx];
        usage.status = UsageStatus::RolledBack;
        usage.rolled_back_at = Some(now);
        let usage = usage.clone();

        if let Some(discount) = state.discounts.get_mut(&usage.discount_id) {
            discount.times_used = discount.times_used.saturating_sub(1);
        }
        Ok(RollbackOutcome::RolledBack(usage))
    }

    async fn usage_for_order(&self, order_id: OrderId) -> Result<Option<DiscountUsage>> {
        let state = self.state.read().await;
        Ok(state
            .by_order
            .get(&order_id)
            .map(|&idx| state.usages[idx].clone()))
    }

    async fn usages_for_discount(&self, discount_id: DiscountId) -> Result<Vec<DiscountUsage>> {
        Ok(self
            .state
            .read()
            .await
            .usages
            .iter()
            .filter(|u| u.discount_id == discount_id)
            .cloned()
            .collect())
    }
}
