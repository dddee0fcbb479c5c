//! Re-evaluates balance alerts as transactions land.

use crate::alerts::AlertDispatcher;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tally_core::events::LedgerEvent;
use tally_core::ids::AccountId;
use tally_core::ports::{EventBus, LedgerStore};
use tally_core::{Error, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Totals for an alert sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertSweepSummary {
    pub evaluated: usize,
    pub notified: usize,
    pub failed: usize,
    pub failed_accounts: Vec<AccountId>,
}

pub struct AlertWatcher {
    dispatcher: Arc<AlertDispatcher>,
    ledger: Arc<dyn LedgerStore>,
}

impl AlertWatcher {
    pub fn new(dispatcher: Arc<AlertDispatcher>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { dispatcher, ledger }
    }

    /// Read the account's balance and let the dispatcher decide.
    pub async fn check(&self, account: &AccountId) -> Result<bool> {
        let balance = self.ledger.get_balance(account).await?;
        let (_, notified) = self.dispatcher.evaluate(account, balance.available()).await?;
        Ok(notified)
    }

    /// Check every account in `accounts`, continuing past failures.
    pub async fn sweep(&self, accounts: &[AccountId]) -> AlertSweepSummary {
        let mut summary = AlertSweepSummary::default();
        for account in accounts {
            match self.check(account).await {
                Ok(notified) => {
                    summary.evaluated += 1;
                    summary.notified += notified as usize;
                }
                Err(Error::AccountNotFound(_)) => {}
                Err(e) => {
                    error!(account = %account, error = %e, "Alert check failed");
                    summary.failed += 1;
                    summary.failed_accounts.push(account.clone());
                }
            }
        }
        info!(
            accounts = accounts.len(),
            notified = summary.notified,
            failed = summary.failed,
            "Alert sweep finished"
        );
        summary
    }

    /// Follow recorded transactions on `bus` until `shutdown` flips.
    pub async fn spawn(self, bus: Arc<dyn EventBus>, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let mut events = bus.subscribe().await?;
        Ok(tokio::spawn(async move {
            info!("Alert watcher started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.next() => match event {
                        Some(LedgerEvent::TransactionRecorded(p)) => {
                            if let Err(e) = self.check(&p.account_id).await {
                                error!(account = %p.account_id, error = %e, "Alert check failed");
                            }
                        }
                        Some(_) => {}
                        None => {
                            debug!("Event bus closed");
                            break;
                        }
                    }
                }
            }
            info!("Alert watcher stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertConfig;
    use crate::bus::LocalEventBus;
    use chrono::Utc;
    use std::time::Duration;
    use tally_core::ports::AlertLog;
    use tally_core::events::{BalanceStatus, TransactionRecordedPayload};
    use tally_core::ledger::{CreditTransactionInput, TransactionType};
    use tally_db::{MemoryAlertLog, MemoryLedgerStore};

    #[tokio::test]
    async fn test_watcher_raises_alert_after_debit() {
        let ledger = Arc::new(MemoryLedgerStore::new());
        let log = Arc::new(MemoryAlertLog::new());
        let bus = Arc::new(LocalEventBus::default());
        let account = AccountId::new("user_1");

        let appended = ledger
            .append(CreditTransactionInput::purchase(account.clone(), 50, "cs_1", "pack"))
            .await
            .unwrap();
        let tx = appended.transaction().clone();

        let dispatcher = Arc::new(AlertDispatcher::new(AlertConfig::default(), log.clone()));
        let (stop, shutdown) = watch::channel(false);
        let handle = AlertWatcher::new(dispatcher, ledger.clone())
            .spawn(bus.clone(), shutdown)
            .await
            .unwrap();

        bus.publish(LedgerEvent::TransactionRecorded(TransactionRecordedPayload {
            account_id: account.clone(),
            transaction_id: tx.id,
            tx_type: TransactionType::Purchase,
            amount: 50,
            balance_after: 50,
            recorded_at: Utc::now(),
        }))
        .await
        .unwrap();

        let mut claimed = None;
        for _ in 0..50 {
            claimed = log.last_notified(&account, BalanceStatus::Low).await.unwrap();
            if claimed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(claimed.is_some());

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_skips_unknown_accounts() {
        let ledger = Arc::new(MemoryLedgerStore::new());
        let account = AccountId::new("user_1");
        ledger
            .append(CreditTransactionInput::purchase(account.clone(), 10, "cs_1", "pack"))
            .await
            .unwrap();
        let dispatcher = Arc::new(AlertDispatcher::new(AlertConfig::default(), Arc::new(MemoryAlertLog::new())));
        let watcher = AlertWatcher::new(dispatcher, ledger);

        let summary = watcher.sweep(&[account, AccountId::new("nobody")]).await;
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.notified, 1);
        assert_eq!(summary.failed, 0);
    }
}
