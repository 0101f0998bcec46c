pub mod admin;
pub mod discounts;
pub mod health;
pub mod inventory;
pub mod orders;
pub mod payments;

use std::str::FromStr;

use axum::http::HeaderMap;
use domain::CommandMetadata;
use event_bus::CORRELATION_HEADER;

use crate::error::ApiError;

/// Parses a UUID-backed identifier taken from the path.
fn parse_id<T: FromStr<Err = uuid::Error>>(id: &str) -> Result<T, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}

/// Command metadata for a request, carrying the caller's correlation id if sent.
fn request_meta(headers: &HeaderMap) -> CommandMetadata {
    let correlation = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());
    match correlation {
        Some(correlation_id) => CommandMetadata::default().with_correlation(correlation_id),
        None => CommandMetadata::default(),
    }
}
