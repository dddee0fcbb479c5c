//! Job definitions.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tally_core::ids::AccountId;
use tally_core::ledger::{Appended, CreditTransactionInput};
use tally_core::ports::LedgerStore;
use tally_metering::{FlushReport, UsageBatcher};
use tally_notify::{AlertSweepSummary, AlertWatcher};
use tally_reconcile::{ReconciliationEngine, SweepSummary};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobName {
    UsageFlush,
    ReconcileSweep,
    AlertSweep,
    FreeRenewal,
}

impl JobName {
    pub const ALL: [JobName; 4] = [
        JobName::UsageFlush,
        JobName::ReconcileSweep,
        JobName::AlertSweep,
        JobName::FreeRenewal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::UsageFlush => "usage-flush",
            JobName::ReconcileSweep => "reconcile-sweep",
            JobName::AlertSweep => "alert-sweep",
            JobName::FreeRenewal => "free-renewal",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        JobName::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| SchedulerError::UnknownJob(s.to_string()))
    }
}

/// Free-allocation renewal totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenewalSummary {
    pub period: String,
    pub granted: usize,
    pub credits: i64,
    /// Accounts already full or already renewed this period.
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "kebab-case")]
pub enum JobReport {
    UsageFlush(FlushReport),
    ReconcileSweep(SweepSummary),
    AlertSweep(AlertSweepSummary),
    FreeRenewal(RenewalSummary),
}

/// The set of jobs and the state they share between runs.
pub struct Jobs {
    ledger: Arc<dyn LedgerStore>,
    batcher: Arc<UsageBatcher>,
    reconciler: Arc<ReconciliationEngine>,
    alerts: Arc<AlertWatcher>,
    lookback: Duration,
    last_runs: Mutex<HashMap<JobName, DateTime<Utc>>>,
    /// Accounts whose last sweep failed, keyed by job.
    retries: Mutex<HashMap<JobName, Vec<AccountId>>>,
}

impl Jobs {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        batcher: Arc<UsageBatcher>,
        reconciler: Arc<ReconciliationEngine>,
        alerts: Arc<AlertWatcher>,
        lookback: Duration,
    ) -> Self {
        Self {
            ledger,
            batcher,
            reconciler,
            alerts,
            lookback,
            last_runs: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, job: JobName) -> Result<JobReport> {
        self.run_at(job, Utc::now()).await
    }

    pub async fn run_at(&self, job: JobName, now: DateTime<Utc>) -> Result<JobReport> {
        info!(job = %job, "Running job");
        let report = match job {
            JobName::UsageFlush => JobReport::UsageFlush(self.batcher.flush().await?),
            JobName::ReconcileSweep => {
                let accounts = self.active_accounts(job, now).await?;
                let summary = self.reconciler.sweep(&accounts).await;
                self.hold_for_retry(job, &summary.failed_accounts).await;
                JobReport::ReconcileSweep(summary)
            }
            JobName::AlertSweep => {
                let accounts = self.active_accounts(job, now).await?;
                let summary = self.alerts.sweep(&accounts).await;
                self.hold_for_retry(job, &summary.failed_accounts).await;
                JobReport::AlertSweep(summary)
            }
            JobName::FreeRenewal => JobReport::FreeRenewal(self.renew_free_allocations(now).await?),
        };
        self.last_runs.lock().await.insert(job, now);
        Ok(report)
    }

    pub async fn last_run(&self, job: JobName) -> Option<DateTime<Utc>> {
        self.last_runs.lock().await.get(&job).copied()
    }

    /// Accounts touched since the job last ran (or within the lookback on
    /// the first run), plus any that failed last time.
    async fn active_accounts(&self, job: JobName, now: DateTime<Utc>) -> Result<Vec<AccountId>> {
        let since = self.last_run(job).await.unwrap_or(now - self.lookback);
        let mut accounts = self.ledger.accounts_active_since(since).await?;
        if let Some(retries) = self.retries.lock().await.get(&job) {
            for account in retries {
                if !accounts.contains(account) {
                    accounts.push(account.clone());
                }
            }
        }
        Ok(accounts)
    }

    async fn hold_for_retry(&self, job: JobName, failed: &[AccountId]) {
        if !failed.is_empty() {
            warn!(job = %job, accounts = failed.len(), "Accounts held for the next run");
        }
        self.retries.lock().await.insert(job, failed.to_vec());
    }

    /// Top every account's free credits back up to its allocation, once per
    /// calendar month.
    pub async fn renew_free_allocations(&self, now: DateTime<Utc>) -> Result<RenewalSummary> {
        let period = now.format("%Y-%m").to_string();
        let key = format!("free-renewal:{}", period);
        let mut summary = RenewalSummary {
            period: period.clone(),
            ..Default::default()
        };

        for account in self.ledger.list_accounts().await? {
            let balance = match self.ledger.get_balance(&account).await {
                Ok(balance) => balance,
                Err(e) => {
                    error!(account = %account, error = %e, "Free renewal failed");
                    summary.failed += 1;
                    continue;
                }
            };
            let top_up = balance.free_allocation - balance.free_available.max(0);
            if top_up <= 0 {
                summary.unchanged += 1;
                continue;
            }

            let input = CreditTransactionInput::grant(
                account.clone(),
                top_up,
                key.clone(),
                format!("Free allocation for {}", period),
            );
            match self.ledger.append(input).await {
                Ok(Appended::Recorded(_)) => {
                    summary.granted += 1;
                    summary.credits += top_up;
                }
                Ok(Appended::Duplicate(_)) => summary.unchanged += 1,
                Err(e) => {
                    error!(account = %account, error = %e, "Free renewal failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            period = %summary.period,
            granted = summary.granted,
            credits = summary.credits,
            failed = summary.failed,
            "Free allocation renewal finished"
        );
        Ok(summary)
    }
}
