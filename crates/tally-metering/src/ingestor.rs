//! Metering ingestor: usage event in, one ledger debit out.

use crate::pricing::RateCard;
use chrono::Utc;
use std::sync::Arc;
use tally_core::events::{LedgerEvent, TransactionRecordedPayload};
use tally_core::ledger::{Appended, CreditTransaction, CreditTransactionInput};
use tally_core::ports::{EventBus, LedgerStore};
use tally_core::usage::{RejectReason, SubmitOutcome, UsageEvent};
use tally_core::{Error, Result};
use tracing::{debug, info, warn};

/// Prices usage events and appends them to the ledger.
pub struct MeteringIngestor {
    ledger: Arc<dyn LedgerStore>,
    rates: RateCard,
    events: Option<Arc<dyn EventBus>>,
    floor: Option<i64>,
}

impl MeteringIngestor {
    pub fn new(ledger: Arc<dyn LedgerStore>, rates: RateCard) -> Self {
        Self {
            ledger,
            rates,
            events: None,
            floor: None,
        }
    }

    /// Publish `TransactionRecorded` for every applied debit.
    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Reject debits that would leave the account below `floor`.
    ///
    /// Off by default: usage that already happened is billed even when it
    /// overdraws the account.
    pub fn with_floor(mut self, floor: i64) -> Self {
        self.floor = Some(floor);
        self
    }

    pub fn rates(&self) -> &RateCard {
        &self.rates
    }

    /// Apply one usage event.
    ///
    /// Errors are transient storage failures: nothing was written and the
    /// producer should resubmit the same event later.
    pub async fn submit(&self, event: &UsageEvent) -> Result<SubmitOutcome> {
        if event.event_id.trim().is_empty() {
            return Ok(reject(event, RejectReason::InvalidEvent {
                message: "event_id must not be empty".to_string(),
            }));
        }
        if event.quantity == 0 {
            return Ok(reject(event, RejectReason::InvalidEvent {
                message: "quantity must be positive".to_string(),
            }));
        }

        let debit = match self.rates.cost(&event.service, event.quantity) {
            Ok(debit) => debit,
            Err(Error::UnknownService(service)) => {
                return Ok(reject(event, RejectReason::UnknownService { service }));
            }
            Err(e) => {
                return Ok(reject(event, RejectReason::InvalidEvent {
                    message: e.to_string(),
                }));
            }
        };

        let description = format!("{} x{}", event.service, event.quantity);
        let mut input = CreditTransactionInput::usage(
            event.account_id.clone(),
            debit,
            event.event_id.clone(),
            description,
        );
        if let Some(floor) = self.floor {
            input = input.with_floor(floor);
        }

        match self.ledger.append(input).await {
            Ok(Appended::Recorded(tx)) => {
                info!(
                    account = %tx.account_id,
                    event_id = %event.event_id,
                    service = %event.service,
                    debit,
                    free_amount = tx.free_amount,
                    paid_amount = tx.paid_amount,
                    balance_after = tx.balance_after,
                    "Usage applied"
                );
                self.publish(&tx).await;
                Ok(SubmitOutcome::Applied {
                    transaction_id: tx.id.to_string(),
                    debit,
                    free_amount: tx.free_amount,
                    paid_amount: tx.paid_amount,
                    balance_after: tx.balance_after,
                })
            }
            Ok(Appended::Duplicate(tx)) => {
                debug!(event_id = %event.event_id, transaction_id = %tx.id, "Usage already applied");
                Ok(SubmitOutcome::Duplicate {
                    transaction_id: tx.id.to_string(),
                })
            }
            Err(Error::InsufficientCredits {
                available,
                required,
            }) => Ok(reject(event, RejectReason::InsufficientCredits {
                available,
                required,
            })),
            Err(Error::InvalidTransaction(message)) => {
                Ok(reject(event, RejectReason::InvalidEvent { message }))
            }
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "Usage not applied");
                Err(e)
            }
        }
    }

    async fn publish(&self, tx: &CreditTransaction) {
        let Some(events) = &self.events else {
            return;
        };
        let event = LedgerEvent::TransactionRecorded(TransactionRecordedPayload {
            account_id: tx.account_id.clone(),
            transaction_id: tx.id,
            tx_type: tx.tx_type,
            amount: tx.amount,
            balance_after: tx.balance_after,
            recorded_at: Utc::now(),
        });
        // The debit is committed; a lost notification only delays observers
        // until their next poll.
        if let Err(e) = events.publish(event).await {
            warn!(transaction_id = %tx.id, error = %e, "Failed to publish transaction event");
        }
    }
}

fn reject(event: &UsageEvent, reason: RejectReason) -> SubmitOutcome {
    warn!(
        account = %event.account_id,
        event_id = %event.event_id,
        service = %event.service,
        reason = ?reason,
        "Usage event rejected"
    );
    SubmitOutcome::Rejected { reason }
}
