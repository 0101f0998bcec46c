//! Operational endpoints: health and Prometheus metrics.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::state::{AppState, Backend};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub event_bus: &'static str,
}

/// GET /health: 200 while the event bus answers, 503 otherwise.
pub async fn check<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
) -> (StatusCode, Json<HealthResponse>) {
    match state.connection.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                event_bus: "connected",
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check: event bus unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    event_bus: "disconnected",
                }),
            )
        }
    }
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
