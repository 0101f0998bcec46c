//! Order placement and lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::UserId;
use domain::{Aggregate, Money, Order, OrderId, OrderLine};
use serde::{Deserialize, Serialize};

use super::{parse_id, request_meta};
use crate::error::ApiError;
use crate::state::{AppState, Backend};

// -- Request types --

#[derive(Deserialize)]
pub struct PlaceOrderRequest {
    pub user_id: Option<String>,
    pub items: Vec<OrderItemRequest>,
    pub discount_code: Option<String>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub warehouse_id: Option<String>,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    pub cancelled_by: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ShipRequest {
    #[serde(default)]
    pub tracking_number: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub order_number: String,
    pub user_id: String,
    pub status: String,
    pub payment_status: String,
    pub status_reason: Option<String>,
    pub items: Vec<OrderItemResponse>,
    pub subtotal_cents: i64,
    pub discount_code: Option<String>,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub reservation_ids: Vec<String>,
    pub reservation_expires_at: Option<String>,
    pub transaction_id: Option<String>,
    pub tracking_number: Option<String>,
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl OrderResponse {
    fn from_order(id: OrderId, order: &Order) -> Self {
        let items = order
            .lines()
            .iter()
            .map(|line| OrderItemResponse {
                product_id: line.product_id.to_string(),
                variant_id: line.variant_id.as_ref().map(|v| v.to_string()),
                product_name: line.product_name.clone(),
                quantity: line.quantity,
                unit_price_cents: line.unit_price.cents(),
            })
            .collect();

        Self {
            id: id.to_string(),
            order_number: order.order_number().to_string(),
            user_id: order.user_id().map(|u| u.to_string()).unwrap_or_default(),
            status: order.status().to_string(),
            payment_status: format!("{:?}", order.payment_status()),
            status_reason: order.status_reason().map(String::from),
            items,
            subtotal_cents: order.subtotal().cents(),
            discount_code: order.discount().map(|d| d.code.clone()),
            discount_cents: order.discount_amount().cents(),
            total_cents: order.total().cents(),
            reservation_ids: order
                .reservation_ids()
                .iter()
                .map(|r| r.to_string())
                .collect(),
            reservation_expires_at: order.reservation_expires_at().map(|t| t.to_rfc3339()),
            transaction_id: order.transaction_id().map(String::from),
            tracking_number: order.tracking_number().map(String::from),
        }
    }
}

/// Response type for event envelope data.
#[derive(Serialize)]
pub struct EventEnvelopeResponse {
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub version: i64,
    pub timestamp: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

// -- Handlers --

/// POST /orders: place an order, reserve its stock and start payment.
///
/// Returns 201 with the order even when the reservation failed; the order is then
/// Cancelled and `status_reason` names the shortfall.
#[tracing::instrument(skip(state, headers, req))]
pub async fn create<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let user_id = match req.user_id.as_deref() {
        Some(id) => parse_id::<UserId>(id)?,
        None => UserId::new(),
    };

    let lines: Vec<OrderLine> = req
        .items
        .into_iter()
        .map(|item| {
            let mut line = OrderLine::new(
                item.product_id,
                item.product_name,
                item.quantity,
                Money::from_cents(item.unit_price_cents),
            );
            if let Some(variant_id) = item.variant_id {
                line = line.with_variant(variant_id);
            }
            if let Some(warehouse_id) = item.warehouse_id {
                line = line.in_warehouse(warehouse_id);
            }
            line
        })
        .collect();

    let discount_code = req.discount_code.as_deref().filter(|c| !c.trim().is_empty());
    let order = state
        .orchestrator
        .place_order(user_id, lines, discount_code, &request_meta(&headers))
        .await?;

    let id = order
        .id()
        .ok_or_else(|| ApiError::Internal("placed order has no id".to_string()))?;
    Ok((StatusCode::CREATED, Json(OrderResponse::from_order(id, &order))))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let order = state
        .orchestrator
        .get_order(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;

    Ok(Json(OrderResponse::from_order(order_id, &order)))
}

/// GET /orders/{id}/events: the order's full event history.
#[tracing::instrument(skip(state))]
pub async fn events<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventEnvelopeResponse>>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let envelopes = state.orchestrator.order_history(order_id).await?;

    let responses = envelopes
        .into_iter()
        .map(|e| EventEnvelopeResponse {
            event_id: e.event_id.to_string(),
            event_type: e.event_type,
            aggregate_id: e.aggregate_id.to_string(),
            version: e.version.as_i64(),
            timestamp: e.timestamp.to_rfc3339(),
            payload: e.payload,
            metadata: serde_json::to_value(e.metadata).unwrap_or_default(),
        })
        .collect();

    Ok(Json(responses))
}

/// POST /orders/{id}/cancel
#[tracing::instrument(skip(state, headers, req))]
pub async fn cancel<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CancelRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason must not be empty".to_string()));
    }

    let order = state
        .orchestrator
        .cancel_order(
            order_id,
            &req.reason,
            req.cancelled_by.as_deref(),
            &request_meta(&headers),
        )
        .await?;

    Ok(Json(OrderResponse::from_order(order_id, &order)))
}

/// POST /orders/{id}/ship
#[tracing::instrument(skip(state, headers, req))]
pub async fn ship<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ShipRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let order = state
        .orchestrator
        .ship_order(
            order_id,
            req.tracking_number.as_deref(),
            &request_meta(&headers),
        )
        .await?;

    Ok(Json(OrderResponse::from_order(order_id, &order)))
}

/// POST /orders/{id}/deliver
#[tracing::instrument(skip(state, headers))]
pub async fn deliver<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let order = state
        .orchestrator
        .deliver_order(order_id, &request_meta(&headers))
        .await?;

    Ok(Json(OrderResponse::from_order(order_id, &order)))
}
