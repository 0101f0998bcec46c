use chrono::{DateTime, Utc};
use common::{DiscountId, UserId};
use domain::{Money, OrderId, OrderLine, ProductId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscountKind {
    /// Whole percent of the eligible amount, 1..=100.
    Percentage { percent: u32 },
    FixedAmount { amount: Money },
}

/// A discount code and the rules for applying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    pub id: DiscountId,
    /// Stored normalized; lookups are case-insensitive.
    pub code: String,
    pub name: String,
    pub kind: DiscountKind,
    pub minimum_order_amount: Option<Money>,
    pub maximum_discount_amount: Option<Money>,
    /// Total number of active usages allowed.
    pub usage_limit: Option<u32>,
    pub usage_limit_per_user: Option<u32>,
    pub times_used: u32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Empty means the discount applies to every product.
    pub applicable_product_ids: Vec<ProductId>,
    pub created_at: DateTime<Utc>,
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

impl Discount {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.starts_at <= now && self.ends_at.is_none_or(|end| now < end)
    }

    pub fn applies_to(&self, product_id: &ProductId) -> bool {
        self.applicable_product_ids.is_empty() || self.applicable_product_ids.contains(product_id)
    }

    pub fn usage_limit_reached(&self) -> bool {
        self.usage_limit.is_some_and(|limit| self.times_used >= limit)
    }

    /// The part of the order the discount can be applied to.
    pub fn eligible_amount(&self, order_amount: Money, items: &[DiscountLine]) -> Money {
        if self.applicable_product_ids.is_empty() || items.is_empty() {
            return order_amount;
        }
        items
            .iter()
            .filter(|item| self.applies_to(&item.product_id))
            .map(DiscountLine::total)
            .sum()
    }

    /// Discount for an eligible amount, capped by the maximum and by the amount itself.
    pub fn amount_for(&self, eligible: Money) -> Money {
        let raw = match self.kind {
            DiscountKind::Percentage { percent } => eligible.percentage(percent),
            DiscountKind::FixedAmount { amount } => amount,
        };
        let capped = match self.maximum_discount_amount {
            Some(max) => raw.min(max),
            None => raw,
        };
        capped.min(eligible).max(Money::ZERO)
    }
}

/// Input for creating a discount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDiscount {
    pub code: String,
    pub name: String,
    pub kind: DiscountKind,
    #[serde(default)]
    pub minimum_order_amount: Option<Money>,
    #[serde(default)]
    pub maximum_discount_amount: Option<Money>,
    #[serde(default)]
    pub usage_limit: Option<u32>,
    #[serde(default)]
    pub usage_limit_per_user: Option<u32>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applicable_product_ids: Vec<ProductId>,
}

impl NewDiscount {
    pub fn new(code: impl Into<String>, name: impl Into<String>, kind: DiscountKind) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            kind,
            minimum_order_amount: None,
            maximum_discount_amount: None,
            usage_limit: None,
            usage_limit_per_user: None,
            starts_at: None,
            ends_at: None,
            applicable_product_ids: Vec::new(),
        }
    }

    pub fn with_minimum_order(mut self, amount: Money) -> Self {
        self.minimum_order_amount = Some(amount);
        self
    }

    pub fn with_maximum_discount(mut self, amount: Money) -> Self {
        self.maximum_discount_amount = Some(amount);
        self
    }

    pub fn with_usage_limit(mut self, limit: u32) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    pub fn with_usage_limit_per_user(mut self, limit: u32) -> Self {
        self.usage_limit_per_user = Some(limit);
        self
    }

    pub fn valid_between(mut self, starts_at: DateTime<Utc>, ends_at: Option<DateTime<Utc>>) -> Self {
        self.starts_at = Some(starts_at);
        self.ends_at = ends_at;
        self
    }

    pub fn for_products(mut self, products: impl IntoIterator<Item = ProductId>) -> Self {
        self.applicable_product_ids = products.into_iter().collect();
        self
    }
}

/// One order line as seen by discount validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl DiscountLine {
    pub fn total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

impl From<&OrderLine> for DiscountLine {
    fn from(line: &OrderLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
        }
    }
}

/// Answer to a validation request. An unusable code is `valid: false`, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountValidation {
    pub valid: bool,
    pub discount: Option<Discount>,
    pub discount_amount: Money,
    pub message: String,
}

impl DiscountValidation {
    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            discount: None,
            discount_amount: Money::ZERO,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageStatus {
    Active,
    RolledBack,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Active => "Active",
            UsageStatus::RolledBack => "RolledBack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(UsageStatus::Active),
            "RolledBack" => Some(UsageStatus::RolledBack),
            _ => None,
        }
    }
}

/// A discount applied to one order. Never deleted; rollback only flips the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountUsage {
    pub id: Uuid,
    pub discount_id: DiscountId,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub order_amount: Money,
    pub discount_amount: Money,
    pub status: UsageStatus,
    pub used_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// Request to record that an order used a discount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUsage {
    pub discount_id: DiscountId,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub order_amount: Money,
    pub discount_amount: Money,
}

impl RecordUsage {
    pub(crate) fn into_usage(self, now: DateTime<Utc>) -> DiscountUsage {
        DiscountUsage {
            id: Uuid::new_v4(),
            discount_id: self.discount_id,
            user_id: self.user_id,
            order_id: self.order_id,
            order_amount: self.order_amount,
            discount_amount: self.discount_amount,
            status: UsageStatus::Active,
            used_at: now,
            rolled_back_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LimitScope {
    Global,
    PerUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(DiscountUsage),
    /// The order already has a usage record; nothing changed.
    AlreadyRecorded(DiscountUsage),
    UsageLimitExceeded(LimitScope),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack(DiscountUsage),
    /// No active usage for the order. Expected when the order used no discount.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub discount_id: DiscountId,
    pub code: String,
    pub times_used: u32,
    pub usage_limit: Option<u32>,
    pub remaining: Option<u32>,
    pub active_usages: usize,
    pub rolled_back_usages: usize,
    pub total_discounted: Money,
}

impl UsageStats {
    pub(crate) fn compute(discount: &Discount, usages: &[DiscountUsage]) -> Self {
        let active: Vec<_> = usages
            .iter()
            .filter(|u| u.status == UsageStatus::Active)
            .collect();
        Self {
            discount_id: discount.id,
            code: discount.code.clone(),
            times_used: discount.times_used,
            usage_limit: discount.usage_limit,
            remaining: discount
                .usage_limit
                .map(|limit| limit.saturating_sub(discount.times_used)),
            active_usages: active.len(),
            rolled_back_usages: usages.len() - active.len(),
            total_discounted: active.iter().map(|u| u.discount_amount).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discount(kind: DiscountKind) -> Discount {
        Discount {
            id: DiscountId::new(),
            code: "SAVE".into(),
            name: "Save".into(),
            kind,
            minimum_order_amount: None,
            maximum_discount_amount: None,
            usage_limit: None,
            usage_limit_per_user: None,
            times_used: 0,
            starts_at: Utc::now() - chrono::Duration::days(1),
            ends_at: None,
            is_active: true,
            applicable_product_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn percentage_is_capped_by_maximum() {
        let mut d = discount(DiscountKind::Percentage { percent: 50 });
        assert_eq!(d.amount_for(Money::from_cents(10_000)), Money::from_cents(5_000));

        d.maximum_discount_amount = Some(Money::from_cents(1_500));
        assert_eq!(d.amount_for(Money::from_cents(10_000)), Money::from_cents(1_500));
    }

    #[test]
    fn fixed_amount_never_exceeds_order() {
        let d = discount(DiscountKind::FixedAmount {
            amount: Money::from_cents(2_000),
        });
        assert_eq!(d.amount_for(Money::from_cents(1_200)), Money::from_cents(1_200));
    }

    #[test]
    fn product_restriction_limits_eligible_amount() {
        let mut d = discount(DiscountKind::Percentage { percent: 10 });
        d.applicable_product_ids = vec![ProductId::new("SKU-1")];
        let items = [
            DiscountLine {
                product_id: "SKU-1".into(),
                quantity: 2,
                unit_price: Money::from_cents(1_000),
            },
            DiscountLine {
                product_id: "SKU-2".into(),
                quantity: 1,
                unit_price: Money::from_cents(5_000),
            },
        ];

        let eligible = d.eligible_amount(Money::from_cents(7_000), &items);
        assert_eq!(eligible, Money::from_cents(2_000));
        assert_eq!(d.amount_for(eligible), Money::from_cents(200));
    }

    #[test]
    fn liveness_respects_window_and_flag() {
        let now = Utc::now();
        let mut d = discount(DiscountKind::Percentage { percent: 10 });
        assert!(d.is_live(now));

        d.ends_at = Some(now - chrono::Duration::seconds(1));
        assert!(!d.is_live(now));

        d.ends_at = None;
        d.is_active = false;
        assert!(!d.is_live(now));
    }

    #[test]
    fn codes_are_normalized() {
        assert_eq!(normalize_code("  summer10 "), "SUMMER10");
    }
}
