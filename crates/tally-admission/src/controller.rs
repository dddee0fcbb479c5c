//! Admission decisions and the runtime continuation policy.

use crate::estimate::{CostEstimate, Estimator, PostProcessingCosts, ServiceProfile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tally_core::ids::AccountId;
use tally_core::ports::LedgerStore;
use tally_core::{Error, Result};
use tally_metering::RateCard;
use tracing::{info, warn};

/// Admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Overdraft a running session may use before it is terminated.
    pub emergency_buffer: i64,
    /// Balance at or below which a running session gets a low-balance warning.
    pub warning_threshold: i64,
    /// How often session monitors re-read the balance.
    pub poll_interval_secs: u64,
    /// How long finished sessions stay queryable.
    pub session_retention_secs: u64,
    pub post_processing: PostProcessingCosts,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            emergency_buffer: 50,
            warning_threshold: 25,
            poll_interval_secs: 5,
            session_retention_secs: 3600,
            post_processing: PostProcessingCosts::default(),
        }
    }
}

impl AdmissionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionWarning {
    /// The session only fits by dipping into the emergency buffer.
    EmergencyBufferRequired { amount: i64 },
    /// Credits missing even with the emergency buffer.
    Shortfall { amount: i64 },
    /// Dropping add-ons and full post-processing would fit.
    SimplifiedProcessingFits { simplified_total: i64 },
    /// The emergency buffer does not cover the gap.
    EmergencyBufferInsufficient { buffer: i64 },
    /// The balance would be at or below the warning threshold afterwards.
    LowBalanceAfterSession { remaining: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Remediation {
    PurchaseCredits { minimum: i64 },
    AcceptSimplifiedProcessing { total: i64 },
    AcceptEmergencyBuffer { amount: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted {
        available: i64,
        uses_emergency_buffer: bool,
        warnings: Vec<AdmissionWarning>,
    },
    Denied {
        available: i64,
        shortfall: i64,
        warnings: Vec<AdmissionWarning>,
        remediation: Vec<Remediation>,
    },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }

    /// The denial as an error, for callers that only propagate.
    pub fn into_result(self) -> Result<Self> {
        match self {
            AdmissionDecision::Denied { shortfall, .. } => Err(Error::AdmissionDenied { shortfall }),
            admitted => Ok(admitted),
        }
    }
}

/// What a live session should do at the observed balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeVerdict {
    /// Balance is below the hard floor.
    Terminate,
    /// Run without add-ons.
    Degrade { requested_by_user: bool },
    /// Keep running, optionally with a low-balance warning.
    Continue { low_balance: bool },
}

/// Admission controller.
pub struct AdmissionController {
    ledger: Arc<dyn LedgerStore>,
    estimator: Estimator,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(ledger: Arc<dyn LedgerStore>, rates: RateCard, config: AdmissionConfig) -> Self {
        Self {
            ledger,
            estimator: Estimator::new(rates, config.post_processing),
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn estimate(&self, profile: &ServiceProfile, planned_minutes: u64) -> Result<CostEstimate> {
        self.estimator.estimate(profile, planned_minutes)
    }

    /// Available credits; an account with no ledger yet has none.
    pub async fn available(&self, account: &AccountId) -> Result<i64> {
        match self.ledger.get_balance(account).await {
            Ok(balance) => Ok(balance.available()),
            Err(Error::AccountNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Decide whether `account` may start a session costing `estimate`.
    pub async fn admit(&self, account: &AccountId, estimate: &CostEstimate) -> Result<AdmissionDecision> {
        let available = self.available(account).await?;
        let decision = self.decide(available, estimate);
        match &decision {
            AdmissionDecision::Admitted {
                uses_emergency_buffer,
                ..
            } => info!(
                account = %account,
                total = estimate.total,
                available,
                uses_emergency_buffer,
                "Session admitted"
            ),
            AdmissionDecision::Denied { shortfall, .. } => warn!(
                account = %account,
                total = estimate.total,
                available,
                shortfall,
                "Session denied"
            ),
        }
        Ok(decision)
    }

    /// Denied iff `estimate.total > available + emergency_buffer`.
    pub fn decide(&self, available: i64, estimate: &CostEstimate) -> AdmissionDecision {
        let buffer = self.config.emergency_buffer;
        let ceiling = available.saturating_add(buffer);
        let total = estimate.total;

        if total <= ceiling {
            let mut warnings = Vec::new();
            let uses_emergency_buffer = total > available;
            if uses_emergency_buffer {
                warnings.push(AdmissionWarning::EmergencyBufferRequired {
                    amount: total.saturating_sub(available),
                });
            }
            let remaining = available.saturating_sub(total);
            if remaining <= self.config.warning_threshold {
                warnings.push(AdmissionWarning::LowBalanceAfterSession { remaining });
            }
            return AdmissionDecision::Admitted {
                available,
                uses_emergency_buffer,
                warnings,
            };
        }

        let shortfall = total.saturating_sub(ceiling);
        let mut warnings = vec![AdmissionWarning::Shortfall { amount: shortfall }];
        let mut remediation = vec![Remediation::PurchaseCredits { minimum: shortfall }];

        if buffer > 0 {
            warnings.push(AdmissionWarning::EmergencyBufferInsufficient { buffer });
        }
        let simplified = estimate.simplified_total;
        if simplified < total && simplified <= ceiling {
            warnings.push(AdmissionWarning::SimplifiedProcessingFits {
                simplified_total: simplified,
            });
            remediation.push(Remediation::AcceptSimplifiedProcessing { total: simplified });
            if simplified > available {
                remediation.push(Remediation::AcceptEmergencyBuffer {
                    amount: simplified.saturating_sub(available),
                });
            }
        }

        AdmissionDecision::Denied {
            available,
            shortfall,
            warnings,
            remediation,
        }
    }

    /// Continuation policy for a live session, in precedence order:
    /// hard floor, explicit user degrade, automatic degrade inside the
    /// emergency buffer, low-balance warning.
    pub fn evaluate(&self, available: i64, degraded_by_user: bool) -> RuntimeVerdict {
        if available < self.config.emergency_buffer.saturating_neg() {
            RuntimeVerdict::Terminate
        } else if degraded_by_user {
            RuntimeVerdict::Degrade {
                requested_by_user: true,
            }
        } else if available < 0 {
            RuntimeVerdict::Degrade {
                requested_by_user: false,
            }
        } else {
            RuntimeVerdict::Continue {
                low_balance: available <= self.config.warning_threshold,
            }
        }
    }
}
