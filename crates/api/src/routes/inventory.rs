//! Stock and reservation endpoints of the inventory service.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::ReservationId;
use domain::{OrderId, ProductId, VariantId};
use inventory::{
    OperationOutcome, ReservationLine, ReservationReceipt, StockCheck, StockItem, StockKey,
    StockReservation,
};
use serde::Deserialize;

use super::parse_id;
use crate::error::ApiError;
use crate::state::{AppState, Backend};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveStockRequest {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub warehouse_id: String,
    pub quantity: u32,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockQuery {
    pub variant_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CheckStockRequest {
    pub items: Vec<ReservationLine>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub order_id: OrderId,
    pub items: Vec<ReservationLine>,
    pub ttl_minutes: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    #[serde(default)]
    pub reservation_ids: Option<Vec<ReservationId>>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /inventory/stock: receive units into a warehouse.
#[tracing::instrument(skip(state, req))]
pub async fn receive<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Json(req): Json<ReceiveStockRequest>,
) -> Result<(StatusCode, Json<StockItem>), ApiError> {
    let mut key = StockKey::new(req.product_id, req.warehouse_id);
    if let Some(variant_id) = req.variant_id {
        key = key.with_variant(variant_id);
    }
    let reason = req.reason.as_deref().unwrap_or("stock received");

    let item = state.inventory.receive_stock(key, req.quantity, reason).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// GET /inventory/stock/{product_id}: stock per warehouse for a product.
#[tracing::instrument(skip(state, query))]
pub async fn stock<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(product_id): Path<String>,
    Query(query): Query<StockQuery>,
) -> Result<Json<Vec<StockItem>>, ApiError> {
    let product_id = ProductId::new(product_id);
    let variant_id = query.variant_id.map(VariantId::new);

    let items = state
        .inventory
        .stock_for_product(&product_id, variant_id.as_ref())
        .await?;
    Ok(Json(items))
}

/// POST /inventory/check: availability without reserving anything.
#[tracing::instrument(skip(state, req))]
pub async fn check<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Json(req): Json<CheckStockRequest>,
) -> Result<Json<StockCheck>, ApiError> {
    Ok(Json(state.inventory.check_stock(&req.items).await?))
}

/// POST /inventory/reservations: reserve every line for an order, or nothing.
#[tracing::instrument(skip(state, req))]
pub async fn reserve<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Json(req): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ReservationReceipt>), ApiError> {
    let ttl = match req.ttl_minutes {
        Some(minutes) if minutes <= 0 => {
            return Err(ApiError::BadRequest(
                "ttlMinutes must be positive".to_string(),
            ));
        }
        Some(minutes) => Some(chrono::Duration::minutes(minutes)),
        None => None,
    };

    let receipt = state.inventory.reserve(req.order_id, &req.items, ttl).await?;
    let status = if receipt.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}

/// GET /inventory/reservations/{order_id}
#[tracing::instrument(skip(state))]
pub async fn reservations<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(order_id): Path<String>,
) -> Result<Json<Vec<StockReservation>>, ApiError> {
    let order_id: OrderId = parse_id(&order_id)?;
    Ok(Json(state.inventory.reservations(order_id).await?))
}

/// POST /inventory/reservations/{order_id}/release: drop Pending holds.
///
/// Without `reservationIds` every Pending reservation of the order is released.
#[tracing::instrument(skip(state, req))]
pub async fn release<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(order_id): Path<String>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<OperationOutcome>, ApiError> {
    let order_id: OrderId = parse_id(&order_id)?;
    let reason = req.reason.as_deref().unwrap_or("released on request");

    let outcome = state
        .inventory
        .release_reservations(order_id, req.reservation_ids.as_deref(), reason)
        .await?;
    Ok(Json(outcome))
}
