//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the ledger domain and its
//! storage and provider adapters.

use crate::checkout::{CheckoutConfirmation, CheckoutVerification};
use crate::events::{BalanceStatus, LedgerEvent};
use crate::ids::AccountId;
use crate::ledger::{Appended, CreditBalance, CreditTransaction, CreditTransactionInput, Page, TransactionType};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = LedgerEvent> + Send>>;

/// Event bus for publishing and subscribing to ledger events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: LedgerEvent) -> Result<()>;

    /// Subscribe to all events published after this call.
    async fn subscribe(&self) -> Result<EventStream>;
}

/// Append-only credit ledger with its cached balance projection.
///
/// Implementations own all writes to transactions and balances. `append`
/// must insert the transaction and update the projection in one atomic
/// unit per account, and must fail closed: on error nothing was written.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the account if missing and set its free allocation.
    async fn ensure_account(&self, account: &AccountId, free_allocation: i64) -> Result<CreditBalance>;

    /// Append a transaction, or return the original one for a reused key.
    async fn append(&self, input: CreditTransactionInput) -> Result<Appended>;

    /// Current cached projection.
    async fn get_balance(&self, account: &AccountId) -> Result<CreditBalance>;

    /// Fold the entire log into a fresh balance. O(n); not for hot paths.
    async fn recompute_balance(&self, account: &AccountId) -> Result<CreditBalance>;

    /// Overwrite the cached projection with `derived`, recording the delta
    /// as a projection-only adjustment. Fails with `VersionConflict` when
    /// the cached version is no longer `expected_version`. Afterwards the
    /// cached version equals the log length, correction included.
    async fn correct_projection(
        &self,
        derived: &CreditBalance,
        expected_version: u64,
        description: &str,
    ) -> Result<CreditTransaction>;

    /// Transaction history, newest first.
    async fn history(
        &self,
        account: &AccountId,
        page: Page,
        filter: Option<TransactionType>,
    ) -> Result<Vec<CreditTransaction>>;

    /// Look up a transaction by its idempotency key.
    async fn find_by_source(
        &self,
        account: &AccountId,
        source_event_id: &str,
    ) -> Result<Option<CreditTransaction>>;

    /// Accounts with at least one transaction at or after `since`.
    async fn accounts_active_since(&self, since: DateTime<Utc>) -> Result<Vec<AccountId>>;

    /// Every account with a balance projection.
    async fn list_accounts(&self) -> Result<Vec<AccountId>>;
}

/// Durable store of checkout confirmations keyed by checkout ID.
#[async_trait]
pub trait CheckoutRepository: Send + Sync {
    async fn get(&self, checkout_id: &str) -> Result<Option<CheckoutConfirmation>>;

    /// Insert or update a record. A resolved record is never overwritten;
    /// the stored record is returned.
    async fn save(&self, confirmation: &CheckoutConfirmation) -> Result<CheckoutConfirmation>;
}

/// Payment provider able to verify a checkout.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Errors are transient (`ProviderVerificationFailed`); permanent
    /// outcomes are reported as `CheckoutVerification::Invalid`.
    async fn verify_checkout(&self, checkout_id: &str) -> Result<CheckoutVerification>;
}

/// Last-notified bookkeeping for balance alerts.
#[async_trait]
pub trait AlertLog: Send + Sync {
    /// Atomically record a notification for `(account, status)` at `now`
    /// unless one was recorded within `cooldown`. Returns whether the
    /// caller won the right to notify.
    async fn try_claim(
        &self,
        account: &AccountId,
        status: BalanceStatus,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool>;

    async fn last_notified(
        &self,
        account: &AccountId,
        status: BalanceStatus,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Account-scoped leases that keep a job from overlapping with itself.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Take the lease for `account` unless another holder has an unexpired one.
    async fn try_acquire(&self, account: &AccountId, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release a lease held by `holder`. Releasing someone else's lease is a no-op.
    async fn release(&self, account: &AccountId, holder: &str) -> Result<()>;
}
