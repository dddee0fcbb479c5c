//! In-process storage backends.
//!
//! Same contracts as the PostgreSQL repositories, held in memory. Appends
//! for one account serialize on a per-account mutex; reads take a snapshot
//! of the projection without waiting for writers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tally_core::checkout::CheckoutConfirmation;
use tally_core::events::BalanceStatus;
use tally_core::ids::{AccountId, TransactionId};
use tally_core::ledger::{
    Appended, CreditBalance, CreditTransaction, CreditTransactionInput, Page, TransactionType,
};
use tally_core::ports::{AlertLog, CheckoutRepository, LeaseManager, LedgerStore};
use tally_core::{Error, Result};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct AccountLog {
    transactions: Vec<CreditTransaction>,
    by_source: HashMap<String, usize>,
}

struct AccountCell {
    log: Mutex<AccountLog>,
    projection: RwLock<CreditBalance>,
}

impl AccountCell {
    fn new(account: AccountId, free_allocation: i64) -> Self {
        Self {
            log: Mutex::new(AccountLog::default()),
            projection: RwLock::new(CreditBalance::new(account, free_allocation)),
        }
    }

    fn snapshot(&self) -> CreditBalance {
        self.projection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, balance: CreditBalance) {
        *self
            .projection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = balance;
    }
}

/// In-memory ledger.
pub struct MemoryLedgerStore {
    accounts: RwLock<HashMap<AccountId, Arc<AccountCell>>>,
    available: AtomicBool,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StorageUnavailable` and nothing is written.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Overwrite the cached projection without touching the log.
    ///
    /// Exists to exercise reconciliation; production code never calls it.
    pub async fn overwrite_projection(
        &self,
        account: &AccountId,
        edit: impl FnOnce(&mut CreditBalance),
    ) -> Result<()> {
        let cell = self
            .cell(account)
            .ok_or_else(|| Error::AccountNotFound(account.clone()))?;
        let _log = cell.log.lock().await;
        let mut balance = cell.snapshot();
        edit(&mut balance);
        cell.store(balance);
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StorageUnavailable("ledger store offline".to_string()))
        }
    }

    fn cell(&self, account: &AccountId) -> Option<Arc<AccountCell>> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account)
            .cloned()
    }

    fn cell_or_create(&self, account: &AccountId, free_allocation: i64) -> Arc<AccountCell> {
        if let Some(cell) = self.cell(account) {
            return cell;
        }
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account.clone())
            .or_insert_with(|| Arc::new(AccountCell::new(account.clone(), free_allocation)))
            .clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_account(&self, account: &AccountId, free_allocation: i64) -> Result<CreditBalance> {
        self.check_available()?;
        if free_allocation < 0 {
            return Err(Error::InvalidInput(
                "free allocation must not be negative".to_string(),
            ));
        }

        let cell = self.cell_or_create(account, free_allocation);
        let _log = cell.log.lock().await;
        let mut balance = cell.snapshot();
        balance.free_allocation = free_allocation;
        cell.store(balance.clone());
        Ok(balance)
    }

    async fn append(&self, input: CreditTransactionInput) -> Result<Appended> {
        self.check_available()?;
        input.validate()?;

        let cell = self.cell_or_create(&input.account_id, 0);
        let mut log = cell.log.lock().await;

        if let Some(&index) = log.by_source.get(&input.source_event_id) {
            debug!(
                account = %input.account_id,
                source_event_id = %input.source_event_id,
                "Duplicate append ignored"
            );
            return Ok(Appended::Duplicate(log.transactions[index].clone()));
        }

        let mut balance = cell.snapshot();
        let (free, paid) = balance.split(input.allocation, input.amount)?;
        let after = balance.available() + input.amount;
        if let Some(floor) = input.floor
            && input.amount < 0
            && after < floor
        {
            return Err(Error::InsufficientCredits {
                available: balance.available(),
                required: -input.amount,
            });
        }

        balance.apply(input.tx_type, input.amount, free, paid);
        balance.version += 1;
        balance.updated_at = Utc::now();
        let record = CreditTransaction::from_input(&input, free, paid, balance.available());

        let index = log.transactions.len();
        log.transactions.push(record.clone());
        log.by_source.insert(record.source_event_id.clone(), index);
        cell.store(balance);

        Ok(Appended::Recorded(record))
    }

    async fn get_balance(&self, account: &AccountId) -> Result<CreditBalance> {
        self.check_available()?;
        self.cell(account)
            .map(|cell| cell.snapshot())
            .ok_or_else(|| Error::AccountNotFound(account.clone()))
    }

    async fn recompute_balance(&self, account: &AccountId) -> Result<CreditBalance> {
        self.check_available()?;
        let cell = self
            .cell(account)
            .ok_or_else(|| Error::AccountNotFound(account.clone()))?;
        let allocation = cell.snapshot().free_allocation;
        let log = cell.log.lock().await;
        Ok(CreditBalance::fold(
            account.clone(),
            allocation,
            &log.transactions,
        ))
    }

    async fn correct_projection(
        &self,
        derived: &CreditBalance,
        expected_version: u64,
        description: &str,
    ) -> Result<CreditTransaction> {
        self.check_available()?;
        let cell = self
            .cell(&derived.account_id)
            .ok_or_else(|| Error::AccountNotFound(derived.account_id.clone()))?;
        let mut log = cell.log.lock().await;

        let cached = cell.snapshot();
        if cached.version != expected_version {
            return Err(Error::VersionConflict {
                account: derived.account_id.clone(),
                expected: expected_version,
                actual: cached.version,
            });
        }

        let free_delta = derived.free_available - cached.free_available;
        let paid_delta = derived.paid_available - cached.paid_available;
        let id = TransactionId::new();
        let record = CreditTransaction {
            id,
            account_id: derived.account_id.clone(),
            tx_type: TransactionType::Adjustment,
            amount: free_delta + paid_delta,
            free_amount: free_delta,
            paid_amount: paid_delta,
            balance_after: derived.available(),
            source_event_id: format!("reconcile:{}", id),
            description: description.to_string(),
            projection_only: true,
            created_at: Utc::now(),
        };

        let mut corrected = cached;
        corrected.free_available = derived.free_available;
        corrected.paid_available = derived.paid_available;
        corrected.total_purchased = derived.total_purchased;
        corrected.total_used = derived.total_used;
        corrected.version = derived.version + 1;
        corrected.updated_at = record.created_at;

        let index = log.transactions.len();
        log.transactions.push(record.clone());
        log.by_source.insert(record.source_event_id.clone(), index);
        cell.store(corrected);

        Ok(record)
    }

    async fn history(
        &self,
        account: &AccountId,
        page: Page,
        filter: Option<TransactionType>,
    ) -> Result<Vec<CreditTransaction>> {
        self.check_available()?;
        let Some(cell) = self.cell(account) else {
            return Ok(Vec::new());
        };
        let log = cell.log.lock().await;
        Ok(log
            .transactions
            .iter()
            .rev()
            .filter(|tx| filter.is_none_or(|t| tx.tx_type == t))
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn find_by_source(
        &self,
        account: &AccountId,
        source_event_id: &str,
    ) -> Result<Option<CreditTransaction>> {
        self.check_available()?;
        let Some(cell) = self.cell(account) else {
            return Ok(None);
        };
        let log = cell.log.lock().await;
        Ok(log
            .by_source
            .get(source_event_id)
            .map(|&index| log.transactions[index].clone()))
    }

    async fn accounts_active_since(&self, since: DateTime<Utc>) -> Result<Vec<AccountId>> {
        self.check_available()?;
        let cells: Vec<(AccountId, Arc<AccountCell>)> = self
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, cell)| (id.clone(), cell.clone()))
            .collect();

        let mut active = Vec::new();
        for (id, cell) in cells {
            let log = cell.log.lock().await;
            if log.transactions.iter().any(|tx| tx.created_at >= since) {
                active.push(id);
            }
        }
        active.sort();
        Ok(active)
    }

    async fn list_accounts(&self) -> Result<Vec<AccountId>> {
        self.check_available()?;
        let mut ids: Vec<AccountId> = self
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-memory checkout confirmations.
#[derive(Default)]
pub struct MemoryCheckoutRepository {
    records: Mutex<HashMap<String, CheckoutConfirmation>>,
}

impl MemoryCheckoutRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckoutRepository for MemoryCheckoutRepository {
    async fn get(&self, checkout_id: &str) -> Result<Option<CheckoutConfirmation>> {
        Ok(self.records.lock().await.get(checkout_id).cloned())
    }

    async fn save(&self, confirmation: &CheckoutConfirmation) -> Result<CheckoutConfirmation> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&confirmation.checkout_id)
            && existing.status.is_final()
        {
            return Ok(existing.clone());
        }
        records.insert(confirmation.checkout_id.clone(), confirmation.clone());
        Ok(confirmation.clone())
    }
}

/// In-memory alert bookkeeping.
#[derive(Default)]
pub struct MemoryAlertLog {
    notified: Mutex<HashMap<(AccountId, BalanceStatus), DateTime<Utc>>>,
}

impl MemoryAlertLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertLog for MemoryAlertLog {
    async fn try_claim(
        &self,
        account: &AccountId,
        status: BalanceStatus,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool> {
        let mut notified = self.notified.lock().await;
        let key = (account.clone(), status);
        if let Some(last) = notified.get(&key)
            && *last > now - cooldown
        {
            return Ok(false);
        }
        notified.insert(key, now);
        Ok(true)
    }

    async fn last_notified(
        &self,
        account: &AccountId,
        status: BalanceStatus,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .notified
            .lock()
            .await
            .get(&(account.clone(), status))
            .copied())
    }
}

/// In-memory leases.
#[derive(Default)]
pub struct MemoryLeaseManager {
    leases: Mutex<HashMap<AccountId, (String, DateTime<Utc>)>>,
}

impl MemoryLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseManager for MemoryLeaseManager {
    async fn try_acquire(&self, account: &AccountId, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut leases = self.leases.lock().await;
        if let Some((owner, expires_at)) = leases.get(account)
            && owner != holder
            && *expires_at >= now
        {
            return Ok(false);
        }
        leases.insert(account.clone(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, account: &AccountId, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(account).is_some_and(|(owner, _)| owner == holder) {
            leases.remove(account);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::checkout::CheckoutStatus;

    fn account() -> AccountId {
        AccountId::new("user_1")
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_original() {
        let store = MemoryLedgerStore::new();
        let first = store
            .append(CreditTransactionInput::purchase(account(), 100, "cs_1", "pack"))
            .await
            .unwrap();
        let second = store
            .append(CreditTransactionInput::purchase(account(), 100, "cs_1", "pack"))
            .await
            .unwrap();

        assert!(second.is_duplicate());
        assert_eq!(first.transaction().id, second.transaction().id);
        let balance = store.get_balance(&account()).await.unwrap();
        assert_eq!(balance.paid_available, 100);
        assert_eq!(balance.version, 1);
    }

    #[tokio::test]
    async fn test_floor_rejects_without_writing() {
        let store = MemoryLedgerStore::new();
        store
            .append(CreditTransactionInput::purchase(account(), 10, "cs_1", "pack"))
            .await
            .unwrap();

        let err = store
            .append(CreditTransactionInput::usage(account(), 15, "evt-1", "call").with_floor(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCredits {
                available: 10,
                required: 15
            }
        ));

        let balance = store.get_balance(&account()).await.unwrap();
        assert_eq!(balance.available(), 10);
        assert_eq!(balance.version, 1);
        assert!(store.find_by_source(&account(), "evt-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ungated_usage_may_overdraw() {
        let store = MemoryLedgerStore::new();
        store
            .append(CreditTransactionInput::usage(account(), 7, "evt-1", "call"))
            .await
            .unwrap();
        assert_eq!(store.get_balance(&account()).await.unwrap().available(), -7);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_closed() {
        let store = MemoryLedgerStore::new();
        store.ensure_account(&account(), 50).await.unwrap();
        store.set_available(false);

        let err = store
            .append(CreditTransactionInput::usage(account(), 5, "evt-1", "call"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        store.set_available(true);
        assert_eq!(store.get_balance(&account()).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_correct_projection_is_version_checked() {
        let store = MemoryLedgerStore::new();
        store
            .append(CreditTransactionInput::purchase(account(), 100, "cs_1", "pack"))
            .await
            .unwrap();
        store
            .overwrite_projection(&account(), |b| b.paid_available = 80)
            .await
            .unwrap();

        let derived = store.recompute_balance(&account()).await.unwrap();
        assert!(store.correct_projection(&derived, 7, "repair").await.is_err());

        let correction = store.correct_projection(&derived, 1, "repair").await.unwrap();
        assert!(correction.projection_only);
        assert_eq!(correction.paid_amount, 20);

        let cached = store.get_balance(&account()).await.unwrap();
        let derived = store.recompute_balance(&account()).await.unwrap();
        assert!(cached.same_amounts(&derived));
        assert_eq!(cached.version, derived.version);
    }

    #[tokio::test]
    async fn test_history_newest_first_with_filter() {
        let store = MemoryLedgerStore::new();
        store
            .append(CreditTransactionInput::purchase(account(), 100, "cs_1", "pack"))
            .await
            .unwrap();
        for i in 0..3 {
            store
                .append(CreditTransactionInput::usage(account(), 1, format!("evt-{i}"), "chat"))
                .await
                .unwrap();
        }

        let usage = store
            .history(&account(), Page::default(), Some(TransactionType::Usage))
            .await
            .unwrap();
        assert_eq!(usage.len(), 3);
        assert_eq!(usage[0].source_event_id, "evt-2");

        let page = store.history(&account(), Page::new(2, 2), None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].tx_type, TransactionType::Purchase);
    }

    #[tokio::test]
    async fn test_resolved_checkout_is_never_overwritten() {
        let repo = MemoryCheckoutRepository::new();
        let done = CheckoutConfirmation::pending("cs_1").succeeded(account(), 500, TransactionId::new());
        repo.save(&done).await.unwrap();

        let stored = repo.save(&CheckoutConfirmation::pending("cs_1")).await.unwrap();
        assert_eq!(stored.status, CheckoutStatus::Success);
        assert_eq!(stored.credits_added, 500);
    }

    #[tokio::test]
    async fn test_alert_claim_respects_cooldown() {
        let log = MemoryAlertLog::new();
        let now = Utc::now();
        let cooldown = Duration::hours(1);

        assert!(log.try_claim(&account(), BalanceStatus::Low, now, cooldown).await.unwrap());
        assert!(!log
            .try_claim(&account(), BalanceStatus::Low, now + Duration::minutes(30), cooldown)
            .await
            .unwrap());
        assert!(log
            .try_claim(&account(), BalanceStatus::Critical, now, cooldown)
            .await
            .unwrap());
        assert!(log
            .try_claim(&account(), BalanceStatus::Low, now + Duration::hours(1), cooldown)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lease_excludes_other_holders() {
        let leases = MemoryLeaseManager::new();
        let ttl = Duration::minutes(5);

        assert!(leases.try_acquire(&account(), "a", ttl).await.unwrap());
        assert!(!leases.try_acquire(&account(), "b", ttl).await.unwrap());

        leases.release(&account(), "b").await.unwrap();
        assert!(!leases.try_acquire(&account(), "b", ttl).await.unwrap());

        leases.release(&account(), "a").await.unwrap();
        assert!(leases.try_acquire(&account(), "b", ttl).await.unwrap());
    }
}
