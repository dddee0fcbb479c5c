//! Scheduler errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Invalid schedule for {job}: {reason}")]
    InvalidSchedule { job: String, reason: String },

    #[error(transparent)]
    Job(#[from] tally_core::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
