//! Balance reconciliation for Tally.
//!
//! The transaction log is the source of truth and the cached balance is a
//! projection of it. Reconciliation refolds the log, compares it with the
//! projection and repairs any difference, logging it as drift.
//!
//! A run never blocks appends while it folds the log. It brackets the fold
//! with two reads of the projection; if the version moved in between, an
//! append raced the fold and the run starts over. The repair itself is a
//! compare-and-swap on the version.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_core::events::{LedgerEvent, ReconciliationDriftPayload};
use tally_core::ids::{AccountId, TransactionId};
use tally_core::ledger::CreditBalance;
use tally_core::ports::{EventBus, LeaseManager, LedgerStore};
use tally_core::{Error, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Lease lifetime; a crashed run frees the account after this long.
    pub lease_ttl_secs: i64,
    /// Attempts before giving up on a busy account.
    pub max_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            max_attempts: 3,
        }
    }
}

/// Difference between the projection and the log, as repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub account_id: AccountId,
    pub free_delta: i64,
    pub paid_delta: i64,
    pub purchased_delta: i64,
    pub used_delta: i64,
    pub cached_version: u64,
    pub log_version: u64,
    pub correction_id: TransactionId,
}

impl Drift {
    fn between(cached: &CreditBalance, derived: &CreditBalance, correction_id: TransactionId) -> Self {
        Self {
            account_id: derived.account_id.clone(),
            free_delta: derived.free_available - cached.free_available,
            paid_delta: derived.paid_available - cached.paid_available,
            purchased_delta: derived.total_purchased - cached.total_purchased,
            used_delta: derived.total_used - cached.total_used,
            cached_version: cached.version,
            log_version: derived.version,
            correction_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Clean { account_id: AccountId, version: u64 },
    Corrected(Drift),
    /// Another run holds the account's lease.
    Skipped { account_id: AccountId },
}

/// Totals for a sweep over many accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub clean: usize,
    pub corrected: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Accounts that errored; the scheduler carries them into the next sweep.
    pub failed_accounts: Vec<AccountId>,
}

pub struct ReconciliationEngine {
    ledger: Arc<dyn LedgerStore>,
    leases: Arc<dyn LeaseManager>,
    events: Option<Arc<dyn EventBus>>,
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        leases: Arc<dyn LeaseManager>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            ledger,
            leases,
            events: None,
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Reconcile one account under its lease.
    pub async fn reconcile(&self, account: &AccountId) -> Result<ReconcileOutcome> {
        let holder = format!("reconcile:{}", Uuid::new_v4());
        let ttl = Duration::seconds(self.config.lease_ttl_secs);
        if !self.leases.try_acquire(account, &holder, ttl).await? {
            debug!(account = %account, "Reconciliation already running; skipping");
            return Ok(ReconcileOutcome::Skipped {
                account_id: account.clone(),
            });
        }

        let result = self.reconcile_held(account).await;

        if let Err(e) = self.leases.release(account, &holder).await {
            warn!(account = %account, error = %e, "Failed to release reconciliation lease");
        }
        result
    }

    async fn reconcile_held(&self, account: &AccountId) -> Result<ReconcileOutcome> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_conflict = None;

        for attempt in 1..=attempts {
            let before = self.ledger.get_balance(account).await?;
            let derived = self.ledger.recompute_balance(account).await?;
            let cached = self.ledger.get_balance(account).await?;

            if before.version != cached.version {
                debug!(account = %account, attempt, "Ledger moved during fold; retrying");
                last_conflict = Some(Error::VersionConflict {
                    account: account.clone(),
                    expected: before.version,
                    actual: cached.version,
                });
                continue;
            }

            if cached.same_amounts(&derived) && cached.version == derived.version {
                debug!(account = %account, version = cached.version, "Balance reconciled clean");
                return Ok(ReconcileOutcome::Clean {
                    account_id: account.clone(),
                    version: cached.version,
                });
            }

            match self
                .ledger
                .correct_projection(&derived, cached.version, "Reconciliation correction")
                .await
            {
                Ok(correction) => {
                    let drift = Drift::between(&cached, &derived, correction.id);
                    warn!(
                        account = %account,
                        free_delta = drift.free_delta,
                        paid_delta = drift.paid_delta,
                        purchased_delta = drift.purchased_delta,
                        used_delta = drift.used_delta,
                        cached_version = drift.cached_version,
                        log_version = drift.log_version,
                        correction_id = %correction.id,
                        "Balance drift corrected"
                    );
                    self.publish(&drift).await;
                    return Ok(ReconcileOutcome::Corrected(drift));
                }
                Err(e @ Error::VersionConflict { .. }) => {
                    debug!(account = %account, attempt, "Correction lost the race; retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or_else(|| Error::Internal("reconciliation gave up".to_string())))
    }

    /// Reconcile each account in turn, continuing past failures.
    pub async fn sweep(&self, accounts: &[AccountId]) -> SweepSummary {
        let mut summary = SweepSummary::default();
        for account in accounts {
            match self.reconcile(account).await {
                Ok(ReconcileOutcome::Clean { .. }) => summary.clean += 1,
                Ok(ReconcileOutcome::Corrected(_)) => summary.corrected += 1,
                Ok(ReconcileOutcome::Skipped { .. }) => summary.skipped += 1,
                Err(e) => {
                    error!(account = %account, error = %e, "Reconciliation failed");
                    summary.failed += 1;
                    summary.failed_accounts.push(account.clone());
                }
            }
        }
        info!(
            accounts = accounts.len(),
            clean = summary.clean,
            corrected = summary.corrected,
            skipped = summary.skipped,
            failed = summary.failed,
            "Reconciliation sweep finished"
        );
        summary
    }

    async fn publish(&self, drift: &Drift) {
        let Some(events) = &self.events else {
            return;
        };
        let event = LedgerEvent::ReconciliationDrift(ReconciliationDriftPayload {
            account_id: drift.account_id.clone(),
            free_delta: drift.free_delta,
            paid_delta: drift.paid_delta,
            purchased_delta: drift.purchased_delta,
            used_delta: drift.used_delta,
            correction_id: drift.correction_id,
            detected_at: Utc::now(),
        });
        if let Err(e) = events.publish(event).await {
            warn!(account = %drift.account_id, error = %e, "Failed to publish drift event");
        }
    }
}
