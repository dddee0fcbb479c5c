//! Session lifecycle handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;
use tally_admission::{Opened, ServiceProfile, Session};
use tally_core::ids::{AccountId, SessionId};

use crate::error::{ApiError, api_error, bad_request};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct OpenSessionRequest {
    pub account_id: AccountId,
    #[serde(default = "ServiceProfile::transcribed_call")]
    pub profile: ServiceProfile,
    pub planned_minutes: u64,
}

fn parse_session_id(id: &str) -> Result<SessionId, ApiError> {
    id.parse().map_err(|_| bad_request("Invalid session ID"))
}

/// Estimate, admit and register a session. A denial answers 402 with the
/// decision and its remediation.
pub async fn open_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<Opened>), ApiError> {
    let opened = state
        .sessions
        .open(request.account_id, request.profile, request.planned_minutes)
        .await
        .map_err(api_error)?;
    let status = if opened.session.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::PAYMENT_REQUIRED
    };
    Ok((status, Json(opened)))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .sessions
        .get(parse_session_id(&id)?)
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .sessions
        .start(parse_session_id(&id)?)
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

pub async fn degrade_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .sessions
        .degrade(parse_session_id(&id)?)
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

pub async fn complete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .sessions
        .complete(parse_session_id(&id)?)
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Json<Vec<Session>> {
    Json(state.sessions.list_for(&AccountId::new(account_id)).await)
}
