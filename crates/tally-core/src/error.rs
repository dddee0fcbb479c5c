//! Error types for Tally.

use crate::ids::{AccountId, SessionId};
use crate::session::SessionState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Ledger errors
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Insufficient credits: {available} available, {required} required")]
    InsufficientCredits { available: i64, required: i64 },

    #[error("Version conflict on {account}: expected {expected}, found {actual}")]
    VersionConflict {
        account: AccountId,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    // Metering errors
    #[error("No pricing configured for service: {0}")]
    UnknownService(String),

    // Purchase errors
    #[error("Checkout verification failed: {0}")]
    ProviderVerificationFailed(String),

    #[error("Checkout invalid: {0}")]
    ProviderCheckoutInvalid(String),

    // Admission errors
    #[error("Admission denied: short by {shortfall} credits")]
    AdmissionDenied { shortfall: i64 },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidSessionTransition { from: SessionState, to: SessionState },

    // Reconciliation errors
    #[error("Reconciliation already running for {0}")]
    LeaseHeld(AccountId),

    // Infrastructure errors
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the same request may succeed if retried later.
    ///
    /// Transient errors never leave partial state behind, so callers can
    /// retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_)
                | Error::ProviderVerificationFailed(_)
                | Error::VersionConflict { .. }
                | Error::LeaseHeld(_)
                | Error::Network(_)
        )
    }

    /// Plain-language remediation for user-facing surfaces.
    pub fn remediation(&self) -> String {
        match self {
            Error::AccountNotFound(_) => "No credit account exists for this user yet.".to_string(),
            Error::InsufficientCredits { required, available } => format!(
                "This needs {} credits but only {} are available. Purchase more credits to continue.",
                required, available
            ),
            Error::UnknownService(service) => format!(
                "Usage for '{}' cannot be billed because it has no price. Contact support.",
                service
            ),
            Error::ProviderVerificationFailed(_) => {
                "We could not confirm your payment yet. Please try again in a moment.".to_string()
            }
            Error::ProviderCheckoutInvalid(_) => {
                "This checkout was cancelled or is invalid. No credits were added.".to_string()
            }
            Error::AdmissionDenied { shortfall } => format!(
                "You need {} more credits to start. Purchase credits, or choose simplified processing.",
                shortfall
            ),
            Error::SessionNotFound(_) => "This session no longer exists.".to_string(),
            Error::InvalidSessionTransition { .. } => {
                "This session cannot perform that action in its current state.".to_string()
            }
            Error::InvalidInput(msg) | Error::InvalidTransaction(msg) => msg.clone(),
            e if e.is_retryable() => {
                "The service is temporarily unavailable. Please try again shortly.".to_string()
            }
            _ => "Something went wrong. Please try again later.".to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::StorageUnavailable("pool timed out".into()).is_retryable());
        assert!(Error::ProviderVerificationFailed("502".into()).is_retryable());
        assert!(!Error::ProviderCheckoutInvalid("expired".into()).is_retryable());
        assert!(!Error::UnknownService("teleport-minute".into()).is_retryable());
    }

    #[test]
    fn test_remediation_hides_internals() {
        let err = Error::Database("relation \"credit_balances\" does not exist".into());
        assert!(!err.remediation().contains("credit_balances"));

        let err = Error::AdmissionDenied { shortfall: 40 };
        assert!(err.remediation().contains("40"));
    }
}
