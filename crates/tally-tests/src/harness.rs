//! Every component wired over in-process storage.

use crate::fixtures::{ScriptedProvider, WEBHOOK_SECRET};
use axum::Router;
use std::sync::Arc;
use tally_api::{AppState, Settings, Stores, build_app};
use tally_billing::StripeConfig;
use tally_core::ids::AccountId;
use tally_core::ledger::CreditTransactionInput;
use tally_core::ports::LedgerStore;
use tally_db::{Database, MemoryAlertLog, MemoryCheckoutRepository, MemoryLeaseManager, MemoryLedgerStore};
use uuid::Uuid;

pub struct Harness {
    pub state: Arc<AppState>,
    /// Concrete handle on the in-process ledger, for fault injection.
    /// `None` for database-backed harnesses.
    pub memory: Option<Arc<MemoryLedgerStore>>,
    pub provider: Arc<ScriptedProvider>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(Self::settings())
    }

    /// Default settings with a webhook secret configured.
    pub fn settings() -> Settings {
        Settings {
            stripe: Some(StripeConfig::new("sk_test").with_webhook_secret(WEBHOOK_SECRET)),
            ..Default::default()
        }
    }

    pub fn with_settings(settings: Settings) -> Self {
        crate::init_test_logging();
        let memory = Arc::new(MemoryLedgerStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let stores = Stores {
            ledger: memory.clone(),
            checkouts: Arc::new(MemoryCheckoutRepository::new()),
            alerts: Arc::new(MemoryAlertLog::new()),
            leases: Arc::new(MemoryLeaseManager::new()),
            provider: provider.clone(),
            database: None,
        };
        Self {
            state: Arc::new(AppState::assemble(stores, &settings)),
            memory: Some(memory),
            provider,
        }
    }

    /// Harness over a migrated PostgreSQL database.
    pub fn postgres(db: Database) -> Self {
        let provider = Arc::new(ScriptedProvider::new());
        let stores = Stores::postgres(db, provider.clone());
        Self {
            state: Arc::new(AppState::assemble(stores, &Self::settings())),
            memory: None,
            provider,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.state.ledger
    }

    pub fn app(&self) -> Router {
        build_app(self.state.clone())
    }

    /// Add paid credits under a fresh idempotency key.
    pub async fn fund(&self, account: &AccountId, credits: i64) {
        self.ledger()
            .append(CreditTransactionInput::purchase(
                account.clone(),
                credits,
                format!("fund_{}", Uuid::new_v4()),
                "test funding",
            ))
            .await
            .unwrap();
    }

    pub async fn available(&self, account: &AccountId) -> i64 {
        self.ledger().get_balance(account).await.unwrap().available()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
