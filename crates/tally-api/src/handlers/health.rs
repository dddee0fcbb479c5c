//! Health check handlers.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Ready once the database answers; always ready on in-process storage.
pub async fn ready(State(state): State<Arc<AppState>>) -> StatusCode {
    match &state.database {
        Some(db) => match db.ping().await {
            Ok(()) => StatusCode::OK,
            Err(e) => {
                warn!(error = %e, "Readiness probe failed");
                StatusCode::SERVICE_UNAVAILABLE
            }
        },
        None => StatusCode::OK,
    }
}
