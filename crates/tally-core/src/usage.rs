//! Usage events emitted by metered services.

use crate::ids::AccountId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Well-known service tags.
pub mod services {
    pub const CALL_MINUTE: &str = "call-minute";
    pub const TRANSCRIPTION_MINUTE: &str = "transcription-minute";
    pub const MODEL_TOKENS: &str = "model-tokens";
    pub const CHAT_MESSAGE: &str = "chat-message";
}

/// One billable unit of consumption.
///
/// Producers must keep `event_id` stable across retries (for example the
/// provider's own message or event ID) so resubmission is deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UsageEvent {
    pub event_id: String,
    pub account_id: AccountId,
    pub service: String,
    pub quantity: u64,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        event_id: impl Into<String>,
        account_id: AccountId,
        service: impl Into<String>,
        quantity: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            account_id,
            service: service.into(),
            quantity,
            occurred_at: Utc::now(),
        }
    }

    /// A minute of call time.
    pub fn call_minute(event_id: impl Into<String>, account_id: AccountId) -> Self {
        Self::new(event_id, account_id, services::CALL_MINUTE, 1)
    }

    /// A batch of model tokens.
    pub fn model_tokens(event_id: impl Into<String>, account_id: AccountId, tokens: u64) -> Self {
        Self::new(event_id, account_id, services::MODEL_TOKENS, tokens)
    }
}

/// Result of submitting a usage event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// A new debit was recorded.
    Applied {
        transaction_id: String,
        debit: i64,
        free_amount: i64,
        paid_amount: i64,
        balance_after: i64,
    },
    /// The event was already applied earlier.
    Duplicate { transaction_id: String },
    /// The event cannot be applied as submitted.
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// No price exists for the service tag.
    UnknownService { service: String },
    /// The event is malformed (zero quantity, empty id).
    InvalidEvent { message: String },
    /// A gated submission would cross the balance floor.
    InsufficientCredits { available: i64, required: i64 },
}
