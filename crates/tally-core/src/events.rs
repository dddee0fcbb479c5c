//! Domain events published by the ledger subsystem.

use crate::ids::{AccountId, SessionId, TransactionId};
use crate::ledger::TransactionType;
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// All events in the ledger subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    TransactionRecorded(TransactionRecordedPayload),
    PurchaseConfirmed(PurchaseConfirmedPayload),
    ReconciliationDrift(ReconciliationDriftPayload),
    SessionStateChanged(SessionStateChangedPayload),
    BalanceAlert(BalanceAlertPayload),
}

impl LedgerEvent {
    /// Routing subject for this event.
    pub fn subject(&self) -> String {
        match self {
            LedgerEvent::TransactionRecorded(p) => {
                format!("ledger.{}.transaction.{}", p.account_id, p.tx_type)
            }
            LedgerEvent::PurchaseConfirmed(p) => format!("billing.{}.purchase", p.account_id),
            LedgerEvent::ReconciliationDrift(p) => format!("ledger.{}.drift", p.account_id),
            LedgerEvent::SessionStateChanged(p) => {
                format!("session.{}.{}", p.session_id, p.state.as_subject())
            }
            LedgerEvent::BalanceAlert(p) => format!("alert.{}.{}", p.account_id, p.status),
        }
    }

    /// Account the event concerns.
    pub fn account_id(&self) -> &AccountId {
        match self {
            LedgerEvent::TransactionRecorded(p) => &p.account_id,
            LedgerEvent::PurchaseConfirmed(p) => &p.account_id,
            LedgerEvent::ReconciliationDrift(p) => &p.account_id,
            LedgerEvent::SessionStateChanged(p) => &p.account_id,
            LedgerEvent::BalanceAlert(p) => &p.account_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransactionRecordedPayload {
    pub account_id: AccountId,
    pub transaction_id: TransactionId,
    pub tx_type: TransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PurchaseConfirmedPayload {
    pub account_id: AccountId,
    pub checkout_id: String,
    pub credits: i64,
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconciliationDriftPayload {
    pub account_id: AccountId,
    pub free_delta: i64,
    pub paid_delta: i64,
    pub purchased_delta: i64,
    pub used_delta: i64,
    pub correction_id: TransactionId,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionStateChangedPayload {
    pub session_id: SessionId,
    pub account_id: AccountId,
    pub from: SessionState,
    pub state: SessionState,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BalanceAlertPayload {
    pub account_id: AccountId,
    pub status: BalanceStatus,
    pub available: i64,
    pub notified_at: DateTime<Utc>,
}

/// Balance health bands used for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStatus {
    Healthy,
    Low,
    Critical,
    Overdraft,
}

impl BalanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceStatus::Healthy => "healthy",
            BalanceStatus::Low => "low",
            BalanceStatus::Critical => "critical",
            BalanceStatus::Overdraft => "overdraft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(BalanceStatus::Healthy),
            "low" => Some(BalanceStatus::Low),
            "critical" => Some(BalanceStatus::Critical),
            "overdraft" => Some(BalanceStatus::Overdraft),
            _ => None,
        }
    }
}

impl fmt::Display for BalanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionState {
    fn as_subject(&self) -> &'static str {
        match self {
            SessionState::NotStarted => "not_started",
            SessionState::Admitted => "admitted",
            SessionState::Running => "running",
            SessionState::Degraded => "degraded",
            SessionState::Completed => "completed",
            SessionState::Terminated => "terminated",
        }
    }
}
