//! Reconciliation and job trigger handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;
use tally_core::ids::AccountId;
use tally_reconcile::ReconcileOutcome;
use tally_scheduler::{JobName, JobReport, SchedulerError};

use crate::error::{ApiError, api_error, bad_request};
use crate::state::AppState;

pub async fn reconcile_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<ReconcileOutcome>, ApiError> {
    let outcome = state
        .reconciler
        .reconcile(&AccountId::new(account_id))
        .await
        .map_err(api_error)?;
    Ok(Json(outcome))
}

pub async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<JobReport>, ApiError> {
    let job: JobName = name.parse().map_err(scheduler_error)?;
    let report = state.jobs.run(job).await.map_err(scheduler_error)?;
    Ok(Json(report))
}

fn scheduler_error(err: SchedulerError) -> ApiError {
    match err {
        SchedulerError::Job(e) => api_error(e),
        other => bad_request(other.to_string()),
    }
}
