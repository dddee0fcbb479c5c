//! Exactly-once purchase confirmation.
//!
//! A checkout is credited at most once through two guarantees working
//! together: the ledger's unique idempotency key (the checkout ID) and the
//! durable confirmation record, which is never overwritten once resolved.
//! Webhook deliveries and client polls for the same checkout are also
//! serialized within the process so only one of them talks to the provider.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tally_core::checkout::{CheckoutConfirmation, CheckoutVerification, ConfirmationResult, validate_checkout_id};
use tally_core::events::{LedgerEvent, PurchaseConfirmedPayload};
use tally_core::ids::AccountId;
use tally_core::ledger::CreditTransactionInput;
use tally_core::ports::{CheckoutRepository, EventBus, LedgerStore, PaymentProvider};
use tally_core::Result;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct PurchaseConfirmer {
    ledger: Arc<dyn LedgerStore>,
    checkouts: Arc<dyn CheckoutRepository>,
    provider: Arc<dyn PaymentProvider>,
    events: Option<Arc<dyn EventBus>>,
    in_flight: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PurchaseConfirmer {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        checkouts: Arc<dyn CheckoutRepository>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            ledger,
            checkouts,
            provider,
            events: None,
            in_flight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Confirm a checkout, crediting the account on verified payment.
    ///
    /// Resolved checkouts replay their stored result with
    /// `already_processed` set. A transient provider or storage failure is
    /// returned as an error and leaves the checkout pending.
    pub async fn confirm(&self, checkout_id: &str) -> Result<ConfirmationResult> {
        validate_checkout_id(checkout_id)?;

        if let Some(existing) = self.checkouts.get(checkout_id).await?
            && existing.status.is_final()
        {
            debug!(checkout_id, status = existing.status.as_str(), "Replaying resolved checkout");
            return Ok(existing.result(true));
        }

        let lock = self.lock_for(checkout_id);
        let result = {
            let _guard = lock.lock().await;
            self.confirm_locked(checkout_id).await
        };
        drop(lock);
        self.release(checkout_id);
        result
    }

    async fn confirm_locked(&self, checkout_id: &str) -> Result<ConfirmationResult> {
        // Another caller may have resolved it while we waited for the lock.
        let record = match self.checkouts.get(checkout_id).await? {
            Some(record) => record,
            None => {
                self.checkouts
                    .save(&CheckoutConfirmation::pending(checkout_id))
                    .await?
            }
        };
        if record.status.is_final() {
            return Ok(record.result(true));
        }

        let verification = self.provider.verify_checkout(checkout_id).await.map_err(|e| {
            warn!(checkout_id, error = %e, "Checkout verification failed; leaving pending");
            e
        })?;

        match verification {
            CheckoutVerification::Pending => {
                debug!(checkout_id, "Checkout payment not completed yet");
                Ok(ConfirmationResult {
                    message: Some("Payment has not completed yet.".to_string()),
                    ..record.result(false)
                })
            }
            CheckoutVerification::Invalid { reason } => self.reject(record, reason).await,
            CheckoutVerification::Paid { credits, .. } if credits <= 0 => {
                self.reject(record, format!("checkout carries {} credits", credits))
                    .await
            }
            CheckoutVerification::Paid {
                account_id,
                credits,
            } => self.credit(record, account_id, credits).await,
        }
    }

    async fn credit(
        &self,
        record: CheckoutConfirmation,
        account_id: AccountId,
        credits: i64,
    ) -> Result<ConfirmationResult> {
        let checkout_id = record.checkout_id.clone();
        let appended = self
            .ledger
            .append(CreditTransactionInput::purchase(
                account_id.clone(),
                credits,
                checkout_id.clone(),
                format!("Credit purchase via checkout {}", checkout_id),
            ))
            .await?;

        // A duplicate means an earlier attempt credited the ledger but did
        // not get to resolve the record; finish that attempt.
        let tx = appended.transaction();
        let candidate = record.succeeded(account_id.clone(), tx.amount, tx.id);
        let stored = self.checkouts.save(&candidate).await?;

        if !appended.is_duplicate() {
            info!(
                checkout_id = %checkout_id,
                account = %account_id,
                credits = tx.amount,
                transaction_id = %tx.id,
                "Purchase confirmed"
            );
            self.publish(LedgerEvent::PurchaseConfirmed(PurchaseConfirmedPayload {
                account_id,
                checkout_id,
                credits: tx.amount,
                transaction_id: tx.id,
            }))
            .await;
        }

        Ok(stored.result(!stored.same_resolution(&candidate)))
    }

    async fn reject(
        &self,
        record: CheckoutConfirmation,
        reason: String,
    ) -> Result<ConfirmationResult> {
        info!(checkout_id = %record.checkout_id, reason = %reason, "Checkout rejected");
        let candidate = record.failed(reason);
        let stored = self.checkouts.save(&candidate).await?;
        Ok(stored.result(!stored.same_resolution(&candidate)))
    }

    async fn publish(&self, event: LedgerEvent) {
        if let Some(events) = &self.events
            && let Err(e) = events.publish(event).await
        {
            warn!(error = %e, "Failed to publish purchase event");
        }
    }

    fn lock_for(&self, checkout_id: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(checkout_id.to_string())
            .or_default()
            .clone()
    }

    fn release(&self, checkout_id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(checkout_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            in_flight.remove(checkout_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tally_core::Error;
    use tally_core::checkout::CheckoutStatus;
    use tally_core::ledger::{Page, TransactionType};
    use tally_db::{MemoryCheckoutRepository, MemoryLedgerStore};

    struct ScriptedProvider {
        responses: std::sync::Mutex<Vec<Result<CheckoutVerification>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<Result<CheckoutVerification>>) -> Self {
            responses.reverse();
            Self {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PaymentProvider for ScriptedProvider {
        async fn verify_checkout(&self, _checkout_id: &str) -> Result<CheckoutVerification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(CheckoutVerification::Pending))
        }
    }

    fn paid() -> Result<CheckoutVerification> {
        Ok(CheckoutVerification::Paid {
            account_id: AccountId::new("user_1"),
            credits: 500,
        })
    }

    fn setup(
        responses: Vec<Result<CheckoutVerification>>,
    ) -> (Arc<MemoryLedgerStore>, Arc<ScriptedProvider>, PurchaseConfirmer) {
        let ledger = Arc::new(MemoryLedgerStore::new());
        let provider = Arc::new(ScriptedProvider::new(responses));
        let confirmer = PurchaseConfirmer::new(
            ledger.clone(),
            Arc::new(MemoryCheckoutRepository::new()),
            provider.clone(),
        );
        (ledger, provider, confirmer)
    }

    #[tokio::test]
    async fn test_replay_returns_stored_result() {
        let (ledger, provider, confirmer) = setup(vec![paid(), paid()]);

        let first = confirmer.confirm("cs_1").await.unwrap();
        let second = confirmer.confirm("cs_1").await.unwrap();

        assert_eq!(first.status, CheckoutStatus::Success);
        assert!(!first.already_processed);
        assert!(second.already_processed);
        assert_eq!(first.credits_added, second.credits_added);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let purchases = ledger
            .history(&AccountId::new("user_1"), Page::default(), Some(TransactionType::Purchase))
            .await
            .unwrap();
        assert_eq!(purchases.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_stays_pending() {
        let (ledger, _provider, confirmer) = setup(vec![
            Err(Error::ProviderVerificationFailed("502 Bad Gateway".into())),
            paid(),
        ]);

        let err = confirmer.confirm("cs_1").await.unwrap_err();
        assert!(err.is_retryable());

        let retried = confirmer.confirm("cs_1").await.unwrap();
        assert_eq!(retried.status, CheckoutStatus::Success);
        assert_eq!(
            ledger.get_balance(&AccountId::new("user_1")).await.unwrap().paid_available,
            500
        );
    }

    #[tokio::test]
    async fn test_invalid_checkout_fails_permanently() {
        let (_ledger, provider, confirmer) = setup(vec![
            Ok(CheckoutVerification::Invalid {
                reason: "checkout session expired".into(),
            }),
            paid(),
        ]);

        let first = confirmer.confirm("cs_1").await.unwrap();
        assert_eq!(first.status, CheckoutStatus::Error);

        let second = confirmer.confirm("cs_1").await.unwrap();
        assert_eq!(second.status, CheckoutStatus::Error);
        assert!(second.already_processed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_checkout_id_is_rejected_before_verification() {
        let (_ledger, provider, confirmer) = setup(vec![paid()]);
        for bad in ["", "  ", "pi_123", "cs_1/../refunds"] {
            assert!(matches!(confirmer.confirm(bad).await, Err(Error::InvalidInput(_))));
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pending_payment_is_not_credited() {
        let (ledger, _provider, confirmer) = setup(vec![Ok(CheckoutVerification::Pending)]);
        let result = confirmer.confirm("cs_1").await.unwrap();
        assert_eq!(result.status, CheckoutStatus::Pending);
        assert!(ledger.get_balance(&AccountId::new("user_1")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_confirms_verify_once() {
        let (ledger, provider, confirmer) = setup(vec![paid(), paid(), paid()]);
        let confirmer = Arc::new(confirmer);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let confirmer = confirmer.clone();
                tokio::spawn(async move { confirmer.confirm("cs_1").await })
            })
            .collect();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.credits_added, 500);
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            ledger.get_balance(&AccountId::new("user_1")).await.unwrap().available(),
            500
        );
    }
}
