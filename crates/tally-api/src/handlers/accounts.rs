//! Balance and history handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_core::ids::AccountId;
use tally_core::ledger::{CreditBalance, CreditTransaction, Page, TransactionType};

use crate::error::{ApiError, api_error};
use crate::state::AppState;

#[derive(Serialize, Deserialize)]
pub struct BalanceResponse {
    pub account_id: AccountId,
    pub available: i64,
    pub free_available: i64,
    pub paid_available: i64,
    pub free_allocation: i64,
    pub total_purchased: i64,
    pub total_used: i64,
    pub status: String,
    pub version: u64,
    pub updated_at: String,
}

impl BalanceResponse {
    fn new(balance: &CreditBalance, state: &AppState) -> Self {
        Self {
            account_id: balance.account_id.clone(),
            available: balance.available(),
            free_available: balance.free_available,
            paid_available: balance.paid_available,
            free_allocation: balance.free_allocation,
            total_purchased: balance.total_purchased,
            total_used: balance.total_used,
            status: state.alerts.classify(balance.available()).to_string(),
            version: balance.version,
            updated_at: balance.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Deserialize)]
pub struct OpenAccountRequest {
    pub free_allocation: Option<i64>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
}

fn default_limit() -> u32 {
    50
}

#[derive(Serialize, Deserialize)]
pub struct HistoryResponse {
    pub transactions: Vec<CreditTransaction>,
    pub limit: u32,
    pub offset: u32,
}

pub async fn open_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    request: Option<Json<OpenAccountRequest>>,
) -> Result<(StatusCode, Json<BalanceResponse>), ApiError> {
    let free_allocation = request
        .and_then(|Json(r)| r.free_allocation)
        .unwrap_or(state.default_free_allocation);
    let balance = state
        .ledger
        .ensure_account(&AccountId::new(account_id), free_allocation)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(BalanceResponse::new(&balance, &state))))
}

pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state
        .ledger
        .get_balance(&AccountId::new(account_id))
        .await
        .map_err(api_error)?;
    Ok(Json(BalanceResponse::new(&balance, &state)))
}

pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let filter = params
        .tx_type
        .as_deref()
        .map(str::parse::<TransactionType>)
        .transpose()
        .map_err(api_error)?;
    let page = Page::new(params.limit, params.offset);

    let transactions = state
        .ledger
        .history(&AccountId::new(account_id), page, filter)
        .await
        .map_err(api_error)?;

    Ok(Json(HistoryResponse {
        transactions,
        limit: page.limit,
        offset: page.offset,
    }))
}
