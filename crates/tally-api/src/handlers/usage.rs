//! Usage intake handlers.

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_core::usage::{SubmitOutcome, UsageEvent};

use crate::error::{ApiError, api_error};
use crate::state::AppState;

#[derive(Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub queued: usize,
    pub pending: usize,
}

/// Price and apply one event now.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(event): Json<UsageEvent>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let outcome = state.ingestor.submit(&event).await.map_err(api_error)?;
    let status = match &outcome {
        SubmitOutcome::Applied { .. } => StatusCode::CREATED,
        SubmitOutcome::Duplicate { .. } => StatusCode::OK,
        SubmitOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(outcome)))
}

/// Queue events for the next usage flush.
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(events): Json<Vec<UsageEvent>>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let mut queued = 0;
    let mut pending = state.batcher.pending().await;
    for event in events {
        pending = state.batcher.enqueue(event).await.map_err(api_error)?;
        queued += 1;
    }
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { queued, pending })))
}
