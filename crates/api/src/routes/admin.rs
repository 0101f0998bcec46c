//! Operator endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use event_bus::{Broker, DeadLetter};

use crate::error::ApiError;
use crate::state::{AppState, Backend, queue_specs};

/// GET /admin/dead-letters: messages parked on every consumed queue's DLQ.
#[tracing::instrument(skip(state))]
pub async fn dead_letters<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let mut parked = Vec::new();
    for spec in queue_specs() {
        parked.extend(state.broker.dead_letters(&spec.name).await?);
    }
    parked.sort_by_key(|letter| letter.dead_lettered_at);
    Ok(Json(parked))
}
