use chrono::Utc;
use common::{DiscountId, UserId};
use domain::{Money, OrderId};

use crate::model::{
    Discount, DiscountKind, DiscountLine, DiscountUsage, DiscountValidation, LimitScope,
    NewDiscount, RecordOutcome, RecordUsage, RollbackOutcome, UsageStats, normalize_code,
};
use crate::store::DiscountStore;
use crate::{DiscountError, Result};

/// Validates discount codes and keeps one usage record per order.
pub struct DiscountTracker<S: DiscountStore> {
    store: S,
}

impl<S: DiscountStore> DiscountTracker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[tracing::instrument(skip(self, new), fields(code = %new.code))]
    pub async fn create_discount(&self, new: NewDiscount) -> Result<Discount> {
        let code = normalize_code(&new.code);
        if code.is_empty() {
            return Err(DiscountError::InvalidDiscount("code must not be empty".into()));
        }
        match new.kind {
            DiscountKind::Percentage { percent } if !(1..=100).contains(&percent) => {
                return Err(DiscountError::InvalidDiscount(format!(
                    "percentage must be between 1 and 100, got {percent}"
                )));
            }
            DiscountKind::FixedAmount { amount } if !amount.is_positive() => {
                return Err(DiscountError::InvalidDiscount(
                    "fixed amount must be positive".into(),
                ));
            }
            _ => {}
        }

        let now = Utc::now();
        let starts_at = new.starts_at.unwrap_or(now);
        if let Some(ends_at) = new.ends_at
            && ends_at <= starts_at
        {
            return Err(DiscountError::InvalidDiscount(
                "end date must be after start date".into(),
            ));
        }

        let discount = Discount {
            id: DiscountId::new(),
            code,
            name: new.name,
            kind: new.kind,
            minimum_order_amount: new.minimum_order_amount,
            maximum_discount_amount: new.maximum_discount_amount,
            usage_limit: new.usage_limit,
            usage_limit_per_user: new.usage_limit_per_user,
            times_used: 0,
            starts_at,
            ends_at: new.ends_at,
            is_active: true,
            applicable_product_ids: new.applicable_product_ids,
            created_at: now,
        };
        self.store.insert_discount(&discount).await?;

        tracing::info!(discount_id = %discount.id, "discount created");
        Ok(discount)
    }

    pub async fn get_discount(&self, id: DiscountId) -> Result<Option<Discount>> {
        self.store.discount(id).await
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<Discount>> {
        self.store.discount_by_code(&normalize_code(code)).await
    }

    /// Checks whether `code` can be applied to an order and computes the amount.
    ///
    /// Per-user caps are only checked when `user_id` is given.
    pub async fn validate(
        &self,
        code: &str,
        order_amount: Money,
        items: &[DiscountLine],
        user_id: Option<UserId>,
    ) -> Result<DiscountValidation> {
        let Some(discount) = self.find_by_code(code).await? else {
            return Ok(DiscountValidation::rejected("discount code not found"));
        };

        if !discount.is_active {
            return Ok(DiscountValidation::rejected("discount is not active"));
        }
        let now = Utc::now();
        if discount.starts_at > now {
            return Ok(DiscountValidation::rejected("discount has not started yet"));
        }
        if discount.ends_at.is_some_and(|end| end <= now) {
            return Ok(DiscountValidation::rejected("discount has expired"));
        }
        if discount.usage_limit_reached() {
            return Ok(DiscountValidation::rejected("discount usage limit reached"));
        }
        if let Some(minimum) = discount.minimum_order_amount
            && order_amount < minimum
        {
            return Ok(DiscountValidation::rejected(format!(
                "minimum order amount is {minimum}"
            )));
        }
        if let (Some(limit), Some(user_id)) = (discount.usage_limit_per_user, user_id) {
            let used = self
                .store
                .active_usages_by_user(discount.id, user_id)
                .await?;
            if used >= limit {
                return Ok(DiscountValidation::rejected(
                    "you have already used this discount the maximum number of times",
                ));
            }
        }

        let eligible = discount.eligible_amount(order_amount, items);
        if !eligible.is_positive() {
            return Ok(DiscountValidation::rejected(
                "discount does not apply to any item in the order",
            ));
        }

        let discount_amount = discount.amount_for(eligible);
        Ok(DiscountValidation {
            valid: true,
            message: format!("discount applied: {discount_amount} off"),
            discount: Some(discount),
            discount_amount,
        })
    }

    /// Records that an order used a discount. Recording the same order twice is a no-op.
    #[tracing::instrument(skip(self, request), fields(order_id = %request.order_id, discount_id = %request.discount_id))]
    pub async fn record_usage(&self, request: RecordUsage) -> Result<RecordOutcome> {
        let outcome = self.store.record_usage(request.into_usage(Utc::now())).await?;

        match &outcome {
            RecordOutcome::Recorded(_) => {
                metrics::counter!("discount_usage_recorded_total").increment(1);
                tracing::info!("discount usage recorded");
            }
            RecordOutcome::AlreadyRecorded(_) => {
                tracing::debug!("discount usage already recorded");
            }
            RecordOutcome::UsageLimitExceeded(scope) => {
                let scope = match scope {
                    LimitScope::Global => "global",
                    LimitScope::PerUser => "per_user",
                };
                tracing::warn!(scope, "discount usage limit exceeded");
            }
        }
        Ok(outcome)
    }

    #[tracing::instrument(skip(self))]
    pub async fn rollback_usage(&self, order_id: OrderId) -> Result<RollbackOutcome> {
        let outcome = self.store.rollback_usage(order_id, Utc::now()).await?;
        match &outcome {
            RollbackOutcome::RolledBack(usage) => {
                metrics::counter!("discount_usage_rolled_back_total").increment(1);
                tracing::info!(discount_id = %usage.discount_id, "discount usage rolled back");
            }
            RollbackOutcome::NotFound => tracing::debug!("no active discount usage to roll back"),
        }
        Ok(outcome)
    }

    pub async fn usage_for_order(&self, order_id: OrderId) -> Result<Option<DiscountUsage>> {
        self.store.usage_for_order(order_id).await
    }

    pub async fn usage_stats(&self, discount_id: DiscountId) -> Result<UsageStats> {
        let discount = self
            .store
            .discount(discount_id)
            .await?
            .ok_or(DiscountError::DiscountNotFound(discount_id))?;
        let usages = self.store.usages_for_discount(discount_id).await?;
        Ok(UsageStats::compute(&discount, &usages))
    }
}
