//! Checkout confirmation records for credit purchases.

use crate::ids::{AccountId, TransactionId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Checkout IDs are provider-issued (`cs_...`) and end up in request paths.
pub fn validate_checkout_id(checkout_id: &str) -> Result<()> {
    let valid = checkout_id.len() <= 255
        && checkout_id
            .strip_prefix("cs_")
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid checkout id {:?}", checkout_id)))
    }
}

/// Resolution state of a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Pending,
    Success,
    Error,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::Pending => "pending",
            CheckoutStatus::Success => "success",
            CheckoutStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => CheckoutStatus::Success,
            "error" => CheckoutStatus::Error,
            _ => CheckoutStatus::Pending,
        }
    }

    /// Resolved checkouts are never verified again.
    pub fn is_final(&self) -> bool {
        !matches!(self, CheckoutStatus::Pending)
    }
}

/// Durable idempotency record for one checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutConfirmation {
    pub checkout_id: String,
    pub account_id: Option<AccountId>,
    pub status: CheckoutStatus,
    pub credits_added: i64,
    pub transaction_id: Option<TransactionId>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutConfirmation {
    pub fn pending(checkout_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            checkout_id: checkout_id.into(),
            account_id: None,
            status: CheckoutStatus::Pending,
            credits_added: 0,
            transaction_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn succeeded(mut self, account_id: AccountId, credits: i64, tx: TransactionId) -> Self {
        self.account_id = Some(account_id);
        self.status = CheckoutStatus::Success;
        self.credits_added = credits;
        self.transaction_id = Some(tx);
        self.error = None;
        self.updated_at = Utc::now();
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.status = CheckoutStatus::Error;
        self.error = Some(reason.into());
        self.updated_at = Utc::now();
        self
    }

    /// Whether two records resolved the checkout the same way, ignoring
    /// timestamps.
    pub fn same_resolution(&self, other: &CheckoutConfirmation) -> bool {
        self.status == other.status
            && self.credits_added == other.credits_added
            && self.transaction_id == other.transaction_id
            && self.error == other.error
    }

    /// Result reported to a caller. Replays set `already_processed`.
    pub fn result(&self, already_processed: bool) -> ConfirmationResult {
        ConfirmationResult {
            checkout_id: self.checkout_id.clone(),
            status: self.status,
            credits_added: self.credits_added,
            already_processed,
            message: self.error.clone(),
        }
    }
}

/// What `confirm` returns to webhook handlers and polling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfirmationResult {
    pub checkout_id: String,
    pub status: CheckoutStatus,
    pub credits_added: i64,
    pub already_processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The payment provider's view of a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutVerification {
    /// Payment captured; credit the account.
    Paid { account_id: AccountId, credits: i64 },
    /// Payment not finished yet.
    Pending,
    /// Cancelled, expired or unknown. Permanent.
    Invalid { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_result_matches_original_except_flag() {
        let record = CheckoutConfirmation::pending("cs_test_1").succeeded(
            AccountId::new("user_1"),
            500,
            TransactionId::new(),
        );
        let first = record.result(false);
        let replay = record.result(true);
        assert_eq!(first.credits_added, replay.credits_added);
        assert_eq!(first.status, CheckoutStatus::Success);
        assert!(replay.already_processed);
    }

    #[test]
    fn test_same_resolution_ignores_timestamps() {
        let tx = TransactionId::new();
        let a = CheckoutConfirmation::pending("cs_1").succeeded(AccountId::new("u"), 10, tx);
        let mut b = a.clone();
        b.updated_at = b.updated_at + chrono::Duration::microseconds(1);
        assert!(a.same_resolution(&b));
        assert!(!a.same_resolution(&CheckoutConfirmation::pending("cs_1").failed("expired")));
    }

    #[test]
    fn test_checkout_id_shape() {
        assert!(validate_checkout_id("cs_test_a1B2").is_ok());
        for bad in ["", "cs_", "pi_123", "cs_../../v1/charges", "cs_1?expand=x", "cs_1/refunds"] {
            assert!(matches!(validate_checkout_id(bad), Err(Error::InvalidInput(_))), "{}", bad);
        }
    }

    #[test]
    fn test_status_finality() {
        assert!(!CheckoutStatus::Pending.is_final());
        assert!(CheckoutStatus::Error.is_final());
        assert_eq!(CheckoutStatus::parse("success"), CheckoutStatus::Success);
    }
}
