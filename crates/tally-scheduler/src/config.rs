//! Scheduler configuration.

use crate::jobs::JobName;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Cron expressions (seconds field first) per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub usage_flush: String,
    pub reconcile_sweep: String,
    pub alert_sweep: String,
    pub free_renewal: String,
    /// How far back the first sweep after start-up looks for active accounts.
    pub first_run_lookback_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            usage_flush: "*/10 * * * * *".to_string(),
            reconcile_sweep: "0 */15 * * * *".to_string(),
            alert_sweep: "0 */5 * * * *".to_string(),
            free_renewal: "0 0 0 1 * *".to_string(),
            first_run_lookback_secs: 86_400,
        }
    }
}

impl SchedulerConfig {
    pub fn schedule_for(&self, job: JobName) -> &str {
        match job {
            JobName::UsageFlush => &self.usage_flush,
            JobName::ReconcileSweep => &self.reconcile_sweep,
            JobName::AlertSweep => &self.alert_sweep,
            JobName::FreeRenewal => &self.free_renewal,
        }
    }

    pub fn first_run_lookback(&self) -> Duration {
        Duration::seconds(self.first_run_lookback_secs)
    }
}
