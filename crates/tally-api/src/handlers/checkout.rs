//! Purchase confirmation handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_billing::{WebhookError, parse_event, process_webhook, verify_signature};
use tally_core::Error;
use tally_core::checkout::ConfirmationResult;
use tracing::warn;

use crate::error::{ApiError, api_error, bad_request};
use crate::state::AppState;

#[derive(Serialize, Deserialize)]
pub struct WebhookResponse {
    pub received: bool,
    /// Absent for event types that do not concern checkouts.
    pub result: Option<ConfirmationResult>,
}

/// Client poll after returning from checkout.
pub async fn confirm(
    State(state): State<Arc<AppState>>,
    Path(checkout_id): Path<String>,
) -> Result<Json<ConfirmationResult>, ApiError> {
    let result = state.confirmer.confirm(&checkout_id).await.map_err(api_error)?;
    Ok(Json(result))
}

/// Stripe webhook endpoint. Transient failures answer 5xx so Stripe redelivers.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let Some(secret) = state.webhook.secret.as_deref() else {
        warn!("Stripe webhook received but no signing secret is configured");
        return Err(api_error(Error::Internal(
            "stripe webhook secret not configured".to_string(),
        )));
    };
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("Missing Stripe-Signature header"))?;

    verify_signature(&body, signature, secret, state.webhook.tolerance, Utc::now()).map_err(webhook_error)?;
    let event = parse_event(&body).map_err(webhook_error)?;
    let result = process_webhook(state.confirmer.as_ref(), event)
        .await
        .map_err(webhook_error)?;

    Ok(Json(WebhookResponse {
        received: true,
        result,
    }))
}

fn webhook_error(err: WebhookError) -> ApiError {
    match err {
        WebhookError::InvalidSignature | WebhookError::StaleTimestamp => {
            warn!(error = %err, "Rejected Stripe webhook");
            bad_request("Webhook signature could not be verified")
        }
        WebhookError::ParseError(message) => bad_request(message),
        WebhookError::HandlerError(e) => api_error(e),
    }
}
