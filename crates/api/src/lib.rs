//! HTTP service hosting the order orchestrator, the inventory engine and the
//! discount tracker in one process, wired together over the event bus.
//!
//! Structured logging goes through `tracing` and counters and histograms are
//! exported in Prometheus format on `/metrics`.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod workers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError, LogFormat};
pub use error::ApiError;
pub use state::{AppState, Backend, InMemoryBackend, PostgresBackend, StartupError, Stores};
pub use workers::spawn_workers;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<B: Backend>(state: Arc<AppState<B>>, metrics_handle: PrometheusHandle) -> Router {
    use routes::{admin, discounts, health, inventory, orders, payments};

    let metrics_router = Router::new()
        .route("/metrics", get(health::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(health::check::<B>))
        .route("/orders", post(orders::create::<B>))
        .route("/orders/{id}", get(orders::get::<B>))
        .route("/orders/{id}/events", get(orders::events::<B>))
        .route("/orders/{id}/cancel", post(orders::cancel::<B>))
        .route("/orders/{id}/ship", post(orders::ship::<B>))
        .route("/orders/{id}/deliver", post(orders::deliver::<B>))
        .route("/inventory/stock", post(inventory::receive::<B>))
        .route("/inventory/stock/{product_id}", get(inventory::stock::<B>))
        .route("/inventory/check", post(inventory::check::<B>))
        .route("/inventory/reservations", post(inventory::reserve::<B>))
        .route(
            "/inventory/reservations/{order_id}",
            get(inventory::reservations::<B>),
        )
        .route(
            "/inventory/reservations/{order_id}/release",
            post(inventory::release::<B>),
        )
        .route("/discounts", post(discounts::create::<B>))
        .route("/discounts/validate", post(discounts::validate::<B>))
        .route("/discounts/{id}/usage", get(discounts::usage::<B>))
        .route("/payments/callback", post(payments::callback::<B>))
        .route("/admin/dead-letters", get(admin::dead_letters::<B>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
