//! Discount definition, validation and usage endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{DiscountId, UserId};
use discount::{Discount, DiscountLine, DiscountValidation, NewDiscount, UsageStats};
use domain::Money;
use serde::Deserialize;

use super::parse_id;
use crate::error::ApiError;
use crate::state::{AppState, Backend};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub code: String,
    /// Cents.
    pub order_amount: Money,
    #[serde(default)]
    pub items: Vec<DiscountLine>,
    pub user_id: Option<UserId>,
}

/// POST /discounts
#[tracing::instrument(skip(state, req))]
pub async fn create<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Json(req): Json<NewDiscount>,
) -> Result<(StatusCode, Json<Discount>), ApiError> {
    let discount = state.discounts.create_discount(req).await?;
    Ok((StatusCode::CREATED, Json(discount)))
}

/// POST /discounts/validate: an unusable code answers 200 with `valid: false`.
#[tracing::instrument(skip(state, req))]
pub async fn validate<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<DiscountValidation>, ApiError> {
    let validation = state
        .discounts
        .validate(&req.code, req.order_amount, &req.items, req.user_id)
        .await?;
    Ok(Json(validation))
}

/// GET /discounts/{id}/usage
#[tracing::instrument(skip(state))]
pub async fn usage<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<UsageStats>, ApiError> {
    let discount_id: DiscountId = parse_id(&id)?;
    Ok(Json(state.discounts.usage_stats(discount_id).await?))
}
