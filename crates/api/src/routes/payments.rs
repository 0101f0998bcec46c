//! Payment provider callbacks.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga::{PaymentCallback, PaymentOutcome};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::{AppState, Backend};

#[derive(Serialize)]
pub struct CallbackAccepted {
    pub message_id: String,
}

/// POST /payments/callback: publishes the outcome for the orchestrator.
///
/// Answers 202 once the event is on the bus; the order changes asynchronously.
#[tracing::instrument(skip(state, callback))]
pub async fn callback<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Json(callback): Json<PaymentCallback>,
) -> Result<(StatusCode, Json<CallbackAccepted>), ApiError> {
    let outcome = match callback.outcome {
        PaymentOutcome::Succeeded { .. } => "succeeded",
        PaymentOutcome::Failed { .. } => "failed",
    };
    metrics::counter!("api_payment_callbacks_total", "outcome" => outcome).increment(1);

    let message_id = state.payment_outcomes.publish(&callback).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CallbackAccepted {
            message_id: message_id.to_string(),
        }),
    ))
}
