//! Buffered usage intake, drained by the usage-flush job.

use crate::ingestor::MeteringIngestor;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tally_core::usage::{RejectReason, SubmitOutcome, UsageEvent};
use tally_core::{Error, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedEvent>,
    /// Events put back because storage was unavailable.
    pub retained: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEvent {
    pub event_id: String,
    pub reason: RejectReason,
}

/// Queue of usage events waiting to be applied.
pub struct UsageBatcher {
    ingestor: Arc<MeteringIngestor>,
    pending: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
}

impl UsageBatcher {
    pub fn new(ingestor: Arc<MeteringIngestor>, capacity: usize) -> Self {
        Self {
            ingestor,
            pending: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Queue an event. Fails with a retryable error when the buffer is full.
    pub async fn enqueue(&self, event: UsageEvent) -> Result<usize> {
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.capacity {
            return Err(Error::StorageUnavailable(format!(
                "usage buffer full ({} events)",
                self.capacity
            )));
        }
        pending.push_back(event);
        Ok(pending.len())
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Apply every queued event in arrival order.
    ///
    /// Stops at the first transient failure and keeps that event and the
    /// rest queued for the next flush.
    pub async fn flush(&self) -> Result<FlushReport> {
        let batch: Vec<UsageEvent> = self.pending.lock().await.drain(..).collect();
        let mut report = FlushReport::default();
        let mut remaining = batch.into_iter();

        while let Some(event) = remaining.next() {
            match self.ingestor.submit(&event).await {
                Ok(SubmitOutcome::Applied { .. }) => report.applied += 1,
                Ok(SubmitOutcome::Duplicate { .. }) => report.duplicates += 1,
                Ok(SubmitOutcome::Rejected { reason }) => {
                    error!(event_id = %event.event_id, reason = ?reason, "Dropping rejected usage event from buffer");
                    report.rejected.push(RejectedEvent {
                        event_id: event.event_id.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    let retained: Vec<UsageEvent> =
                        std::iter::once(event).chain(remaining).collect();
                    report.retained = retained.len();
                    warn!(retained = report.retained, error = %e, "Usage flush interrupted");

                    let mut pending = self.pending.lock().await;
                    for event in retained.into_iter().rev() {
                        pending.push_front(event);
                    }
                    break;
                }
            }
        }

        info!(
            applied = report.applied,
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            retained = report.retained,
            "Usage buffer flushed"
        );
        Ok(report)
    }

    /// Flush until the queue is empty or `timeout` runs out, pausing
    /// `retry_delay` after an interrupted flush. Returns the events still
    /// queued.
    pub async fn drain(&self, timeout: Duration, retry_delay: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending().await == 0 {
                return 0;
            }
            let interrupted = match self.flush().await {
                Ok(report) => report.retained > 0,
                Err(e) => {
                    warn!(error = %e, "Usage drain flush failed");
                    true
                }
            };
            let left = self.pending().await;
            if left == 0 {
                return 0;
            }
            if tokio::time::Instant::now() + retry_delay > deadline {
                return left;
            }
            if interrupted {
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}
