//! Cron loop driving the jobs.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::jobs::{JobName, Jobs};
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    jobs: Arc<Jobs>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(jobs: Arc<Jobs>, config: SchedulerConfig) -> Self {
        Self { jobs, config }
    }

    pub fn jobs(&self) -> &Arc<Jobs> {
        &self.jobs
    }

    /// Parse every job's cron expression.
    pub fn schedules(&self) -> Result<Vec<(JobName, Schedule)>> {
        JobName::ALL
            .into_iter()
            .map(|job| {
                let expr = self.config.schedule_for(job);
                Schedule::from_str(expr)
                    .map(|schedule| (job, schedule))
                    .map_err(|e| SchedulerError::InvalidSchedule {
                        job: job.to_string(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    /// Start one loop per job. Loops exit when `shutdown` flips.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        if !self.config.enabled {
            info!("Scheduler disabled");
            return Ok(Vec::new());
        }
        let schedules = self.schedules()?;
        Ok(schedules
            .into_iter()
            .map(|(job, schedule)| {
                tokio::spawn(run_loop(self.jobs.clone(), job, schedule, shutdown.clone()))
            })
            .collect())
    }
}

async fn run_loop(jobs: Arc<Jobs>, job: JobName, schedule: Schedule, mut shutdown: watch::Receiver<bool>) {
    info!(job = %job, "Job scheduled");
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(job = %job, "Schedule has no future runs");
            break;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or_default();
        debug!(job = %job, next = %next, "Waiting for next run");

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {
                if let Err(e) = jobs.run(job).await {
                    error!(job = %job, error = %e, "Scheduled job failed");
                }
            }
        }
    }
    info!(job = %job, "Job loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tally_db::{MemoryAlertLog, MemoryLeaseManager, MemoryLedgerStore};
    use tally_metering::{MeteringIngestor, RateCard, UsageBatcher};
    use tally_notify::{AlertConfig, AlertDispatcher, AlertWatcher};
    use tally_reconcile::{ReconcileConfig, ReconciliationEngine};

    fn jobs() -> Arc<Jobs> {
        let ledger = Arc::new(MemoryLedgerStore::new());
        let ingestor = Arc::new(MeteringIngestor::new(ledger.clone(), RateCard::default()));
        let dispatcher = Arc::new(AlertDispatcher::new(
            AlertConfig::default(),
            Arc::new(MemoryAlertLog::new()),
        ));
        Arc::new(Jobs::new(
            ledger.clone(),
            Arc::new(UsageBatcher::new(ingestor, 10)),
            Arc::new(ReconciliationEngine::new(
                ledger.clone(),
                Arc::new(MemoryLeaseManager::new()),
                ReconcileConfig::default(),
            )),
            Arc::new(AlertWatcher::new(dispatcher, ledger)),
            Duration::hours(1),
        ))
    }

    #[test]
    fn test_default_schedules_parse() {
        let scheduler = Scheduler::new(jobs(), SchedulerConfig::default());
        assert_eq!(scheduler.schedules().unwrap().len(), 4);
    }

    #[test]
    fn test_invalid_schedule_names_the_job() {
        let config = SchedulerConfig {
            alert_sweep: "every five minutes".to_string(),
            ..Default::default()
        };
        let scheduler = Scheduler::new(jobs(), config);
        match scheduler.schedules() {
            Err(SchedulerError::InvalidSchedule { job, .. }) => assert_eq!(job, "alert-sweep"),
            other => panic!("unexpected result: {:?}", other.map(|s| s.len())),
        }
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let scheduler = Scheduler::new(jobs(), SchedulerConfig::default());
        let (stop, shutdown) = watch::channel(false);
        let handles = scheduler.spawn(shutdown).unwrap();
        assert_eq!(handles.len(), 4);

        stop.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_disabled_scheduler_spawns_nothing() {
        let config = SchedulerConfig {
            enabled: false,
            ..Default::default()
        };
        let scheduler = Scheduler::new(jobs(), config);
        let (_stop, shutdown) = watch::channel(false);
        assert!(scheduler.spawn(shutdown).unwrap().is_empty());
    }
}
