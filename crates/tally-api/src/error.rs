//! Mapping of ledger errors onto HTTP responses.

use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use tally_core::Error;
use tracing::error;

/// JSON error body. `message` is safe to show to end users.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn api_error(err: Error) -> ApiError {
    let (status, code) = match &err {
        Error::AccountNotFound(_) => (StatusCode::NOT_FOUND, "account_not_found"),
        Error::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
        Error::InsufficientCredits { .. } => (StatusCode::PAYMENT_REQUIRED, "insufficient_credits"),
        Error::AdmissionDenied { .. } => (StatusCode::PAYMENT_REQUIRED, "admission_denied"),
        Error::VersionConflict { .. } => (StatusCode::CONFLICT, "version_conflict"),
        Error::LeaseHeld(_) => (StatusCode::CONFLICT, "lease_held"),
        Error::InvalidSessionTransition { .. } => (StatusCode::CONFLICT, "invalid_session_transition"),
        Error::InvalidTransaction(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_transaction"),
        Error::UnknownService(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unknown_service"),
        Error::ProviderCheckoutInvalid(_) => (StatusCode::UNPROCESSABLE_ENTITY, "checkout_invalid"),
        Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        Error::ProviderVerificationFailed(_) => (StatusCode::BAD_GATEWAY, "provider_verification_failed"),
        Error::StorageUnavailable(_) | Error::Network(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        Error::Database(_) | Error::Serialization(_) | Error::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };

    if status.is_server_error() {
        error!(error = %err, status = status.as_u16(), "Request failed");
    }

    (
        status,
        Json(ErrorBody {
            error: code.to_string(),
            message: err.remediation(),
            retryable: err.is_retryable(),
        }),
    )
}

/// A 400 for malformed path or query input.
pub fn bad_request(message: impl Into<String>) -> ApiError {
    api_error(Error::InvalidInput(message.into()))
}
