//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use discount::DiscountError;
use domain::{DomainError, OrderError};
use event_bus::BusError;
use inventory::InventoryError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
///
/// Internal failures are logged with their detail and answered with a generic body.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// The request conflicts with current state (status, stock, uniqueness).
    Conflict(String),
    /// Well-formed but rejected by a business rule.
    Unprocessable(String),
    /// A dependency is temporarily down; the client may retry.
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => {
                tracing::warn!(error = %msg, "dependency unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service temporarily unavailable, retry later".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn order_error(err: &OrderError) -> ApiError {
    match err {
        OrderError::InvalidStateTransition { .. }
        | OrderError::CancellationNotAllowed { .. }
        | OrderError::RefundNotApplicable { .. }
        | OrderError::AlreadyPlaced => ApiError::Conflict(err.to_string()),
        OrderError::NotPlaced => ApiError::NotFound(err.to_string()),
        OrderError::NoLines | OrderError::InvalidQuantity { .. } | OrderError::InvalidPrice { .. } => {
            ApiError::BadRequest(err.to_string())
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match &err {
            DomainError::Order(order_err) => order_error(order_err),
            DomainError::AggregateNotFound { .. } => ApiError::NotFound(err.to_string()),
            _ if err.is_transient() => ApiError::Unavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        match &err {
            InventoryError::InsufficientStock(_) | InventoryError::Contention(_) => {
                ApiError::Conflict(err.to_string())
            }
            InventoryError::NoLines | InventoryError::InvalidQuantity { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            InventoryError::StockItemNotFound(_) => ApiError::NotFound(err.to_string()),
            _ if err.is_transient() => ApiError::Unavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DiscountError> for ApiError {
    fn from(err: DiscountError) -> Self {
        match &err {
            DiscountError::DuplicateCode(_) => ApiError::Conflict(err.to_string()),
            DiscountError::InvalidDiscount(_) => ApiError::Unprocessable(err.to_string()),
            DiscountError::DiscountNotFound(_) => ApiError::NotFound(err.to_string()),
            _ if err.is_transient() => ApiError::Unavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        if err.is_transient() {
            ApiError::Unavailable(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::OrderNotFound(_) => ApiError::NotFound(err.to_string()),
            SagaError::DiscountRejected(_) => ApiError::Unprocessable(err.to_string()),
            SagaError::PaymentNotExpected(_) => ApiError::Conflict(err.to_string()),
            SagaError::Domain(err) => err.into(),
            SagaError::Inventory(err) => err.into(),
            SagaError::Discount(err) => err.into(),
            SagaError::Bus(err) => err.into(),
            SagaError::Payment(ref payment) if payment.is_transient() => {
                ApiError::Unavailable(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
