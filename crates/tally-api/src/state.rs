//! Application state shared across handlers.

use crate::config::Settings;
use chrono::Duration;
use std::sync::Arc;
use tally_admission::{AdmissionController, SessionRegistry};
use tally_billing::PurchaseConfirmer;
use tally_core::ports::{AlertLog, CheckoutRepository, EventBus, LeaseManager, LedgerStore, PaymentProvider};
use tally_db::{Database, MemoryAlertLog, MemoryCheckoutRepository, MemoryLeaseManager, MemoryLedgerStore};
use tally_metering::{MeteringIngestor, UsageBatcher};
use tally_notify::{AlertDispatcher, AlertWatcher, LocalEventBus};
use tally_reconcile::ReconciliationEngine;
use tally_scheduler::Jobs;

/// Storage adapters and the payment provider.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub checkouts: Arc<dyn CheckoutRepository>,
    pub alerts: Arc<dyn AlertLog>,
    pub leases: Arc<dyn LeaseManager>,
    pub provider: Arc<dyn PaymentProvider>,
    /// Probed by the readiness check when present.
    pub database: Option<Database>,
}

impl Stores {
    /// PostgreSQL-backed stores.
    pub fn postgres(database: Database, provider: Arc<dyn PaymentProvider>) -> Self {
        Self {
            ledger: Arc::new(database.ledger()),
            checkouts: Arc::new(database.checkouts()),
            alerts: Arc::new(database.alerts()),
            leases: Arc::new(database.leases()),
            provider,
            database: Some(database),
        }
    }

    /// In-process stores for single-node runs and tests.
    pub fn in_memory(provider: Arc<dyn PaymentProvider>) -> Self {
        Self {
            ledger: Arc::new(MemoryLedgerStore::new()),
            checkouts: Arc::new(MemoryCheckoutRepository::new()),
            alerts: Arc::new(MemoryAlertLog::new()),
            leases: Arc::new(MemoryLeaseManager::new()),
            provider,
            database: None,
        }
    }
}

/// Stripe webhook verification settings.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: Option<String>,
    pub tolerance: Duration,
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub ingestor: Arc<MeteringIngestor>,
    pub batcher: Arc<UsageBatcher>,
    pub confirmer: Arc<PurchaseConfirmer>,
    pub sessions: Arc<SessionRegistry>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub alerts: Arc<AlertDispatcher>,
    pub watcher: Arc<AlertWatcher>,
    pub jobs: Arc<Jobs>,
    pub event_bus: Arc<dyn EventBus>,
    pub webhook: WebhookSettings,
    pub default_free_allocation: i64,
    pub database: Option<Database>,
}

impl AppState {
    /// Wire every component over `stores` with one shared event bus.
    pub fn assemble(stores: Stores, settings: &Settings) -> Self {
        let event_bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new(settings.server.event_buffer));

        let mut ingestor = MeteringIngestor::new(stores.ledger.clone(), settings.rates.clone())
            .with_events(event_bus.clone());
        if let Some(floor) = settings.metering.floor {
            ingestor = ingestor.with_floor(floor);
        }
        let ingestor = Arc::new(ingestor);
        let batcher = Arc::new(UsageBatcher::new(ingestor.clone(), settings.metering.batch_capacity));

        let confirmer = Arc::new(
            PurchaseConfirmer::new(stores.ledger.clone(), stores.checkouts.clone(), stores.provider.clone())
                .with_events(event_bus.clone()),
        );

        let controller = Arc::new(AdmissionController::new(
            stores.ledger.clone(),
            settings.rates.clone(),
            settings.admission.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new(controller).with_events(event_bus.clone()));

        let reconciler = Arc::new(
            ReconciliationEngine::new(stores.ledger.clone(), stores.leases.clone(), settings.reconcile.clone())
                .with_events(event_bus.clone()),
        );

        let alerts = Arc::new(
            AlertDispatcher::new(settings.alerts.clone(), stores.alerts.clone()).with_events(event_bus.clone()),
        );
        let watcher = Arc::new(AlertWatcher::new(alerts.clone(), stores.ledger.clone()));

        let jobs = Arc::new(Jobs::new(
            stores.ledger.clone(),
            batcher.clone(),
            reconciler.clone(),
            watcher.clone(),
            settings.scheduler.first_run_lookback(),
        ));

        let webhook = match &settings.stripe {
            Some(stripe) => WebhookSettings {
                secret: stripe.webhook_secret.clone(),
                tolerance: Duration::seconds(stripe.webhook_tolerance_secs),
            },
            None => WebhookSettings {
                secret: None,
                tolerance: Duration::seconds(300),
            },
        };

        Self {
            ledger: stores.ledger,
            ingestor,
            batcher,
            confirmer,
            sessions,
            reconciler,
            alerts,
            watcher,
            jobs,
            event_bus,
            webhook,
            default_free_allocation: settings.ledger.default_free_allocation,
            database: stores.database,
        }
    }
}
