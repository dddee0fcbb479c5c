//! Background jobs for Tally.
//!
//! Each job is idempotent and can run on its cron schedule or on demand.

pub mod config;
pub mod error;
pub mod jobs;
pub mod runner;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use jobs::{JobName, JobReport, Jobs, RenewalSummary};
pub use runner::Scheduler;
