//! Command handlers.

use crate::config::TallyConfig;
use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tally_api::{AppState, Stores, build_app, serve as serve_http};
use tally_billing::{StripeClient, StripeConfig};
use tally_core::ids::AccountId;
use tally_core::ledger::{Page, TransactionType};
use tally_core::ports::PaymentProvider;
use tally_db::Database;
use tally_notify::AlertWatcher;
use tally_scheduler::{JobName, Scheduler};
use tokio::sync::watch;
use tracing::{error, info, warn};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn payment_provider(config: &TallyConfig) -> anyhow::Result<Arc<dyn PaymentProvider>> {
    let stripe = match &config.stripe {
        Some(stripe) => stripe.clone(),
        None => {
            warn!("Stripe is not configured; checkout confirmation will fail");
            StripeConfig::new("")
        }
    };
    Ok(Arc::new(StripeClient::new(stripe)?))
}

async fn connect(config: &TallyConfig) -> anyhow::Result<Option<Database>> {
    match &config.ledger.database {
        Some(db) => Ok(Some(
            Database::connect(db).await.context("connecting to PostgreSQL")?,
        )),
        None => Ok(None),
    }
}

async fn open_state(config: &TallyConfig, migrate: bool) -> anyhow::Result<Arc<AppState>> {
    let provider = payment_provider(config)?;
    let stores = match connect(config).await? {
        Some(db) => {
            if migrate {
                db.migrate().await.context("running migrations")?;
                info!("Migrations applied");
            }
            Stores::postgres(db, provider)
        }
        None => {
            warn!("No database configured; using in-process storage");
            Stores::in_memory(provider)
        }
    };
    Ok(Arc::new(AppState::assemble(stores, &config.settings())))
}

pub async fn serve(config: TallyConfig, migrate: bool) -> anyhow::Result<()> {
    let state = open_state(&config, migrate).await?;
    let (stop, shutdown) = watch::channel(false);

    let scheduler = Scheduler::new(state.jobs.clone(), config.scheduler.clone());
    let mut tasks = scheduler.spawn(shutdown.clone())?;
    let watcher = AlertWatcher::new(state.alerts.clone(), state.ledger.clone());
    tasks.push(watcher.spawn(state.event_bus.clone(), shutdown.clone()).await?);

    let app = build_app(state.clone());
    serve_http(app, &config.server, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    })
    .await?;

    stop.send_replace(true);
    for task in tasks {
        task.await.ok();
    }

    // Accepted batch usage is owed; apply it before exiting.
    let left = state
        .batcher
        .drain(config.metering.drain_timeout(), Duration::from_secs(1))
        .await;
    if left > 0 {
        error!(events = left, "Queued usage was not applied before shutdown");
    }
    info!("Tally stopped");
    Ok(())
}

pub async fn migrate(config: &TallyConfig) -> anyhow::Result<()> {
    let db = connect(config)
        .await?
        .context("ledger.database is not configured")?;
    db.migrate().await?;
    println!("Migrations applied");
    Ok(())
}

pub async fn balance(config: &TallyConfig, account_id: &str) -> anyhow::Result<()> {
    let state = open_state(config, false).await?;
    let balance = state.ledger.get_balance(&AccountId::new(account_id)).await?;
    print_json(&balance)
}

pub async fn history(
    config: &TallyConfig,
    account_id: &str,
    limit: u32,
    offset: u32,
    tx_type: Option<&str>,
) -> anyhow::Result<()> {
    let filter = tx_type.map(str::parse::<TransactionType>).transpose()?;
    let state = open_state(config, false).await?;
    let transactions = state
        .ledger
        .history(&AccountId::new(account_id), Page::new(limit, offset), filter)
        .await?;
    print_json(&transactions)
}

pub async fn reconcile(config: &TallyConfig, account_id: Option<&str>) -> anyhow::Result<()> {
    let state = open_state(config, false).await?;
    match account_id {
        Some(id) => print_json(&state.reconciler.reconcile(&AccountId::new(id)).await?),
        None => {
            let accounts = state.ledger.list_accounts().await?;
            print_json(&state.reconciler.sweep(&accounts).await)
        }
    }
}

pub async fn run_job(config: &TallyConfig, name: &str) -> anyhow::Result<()> {
    let job: JobName = name.parse()?;
    let state = open_state(config, false).await?;
    print_json(&state.jobs.run(job).await?)
}

pub fn list_jobs(config: &TallyConfig) {
    for job in JobName::ALL {
        println!("{:<16} {}", job.as_str(), config.scheduler.schedule_for(job));
    }
}
