//! Cost estimate and admission handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_admission::{AdmissionDecision, CostEstimate, ServiceProfile};
use tally_core::ids::AccountId;

use crate::error::{ApiError, api_error};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct EstimateRequest {
    #[serde(default = "ServiceProfile::transcribed_call")]
    pub profile: ServiceProfile,
    pub planned_minutes: u64,
}

#[derive(Serialize, Deserialize)]
pub struct AdmitResponse {
    pub estimate: CostEstimate,
    pub decision: AdmissionDecision,
}

pub async fn estimate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EstimateRequest>,
) -> Result<Json<CostEstimate>, ApiError> {
    let estimate = state
        .sessions
        .controller()
        .estimate(&request.profile, request.planned_minutes)
        .map_err(api_error)?;
    Ok(Json(estimate))
}

/// Dry-run admission: nothing is registered.
pub async fn admit(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(request): Json<EstimateRequest>,
) -> Result<Json<AdmitResponse>, ApiError> {
    let controller = state.sessions.controller();
    let estimate = controller
        .estimate(&request.profile, request.planned_minutes)
        .map_err(api_error)?;
    let decision = controller
        .admit(&AccountId::new(account_id), &estimate)
        .await
        .map_err(api_error)?;
    Ok(Json(AdmitResponse { estimate, decision }))
}
