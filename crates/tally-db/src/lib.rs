//! Ledger storage for Tally.
//!
//! PostgreSQL repositories for production and in-process implementations
//! of the same ports for tests and single-node development.

pub mod memory;
pub mod repositories;

pub use memory::{MemoryAlertLog, MemoryCheckoutRepository, MemoryLeaseManager, MemoryLedgerStore};
pub use repositories::*;
pub(crate) use repositories::storage_err;

use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tally_core::Result;

/// Ledger settings: storage backend and account defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerConfig {
    /// PostgreSQL connection. Without one the in-process store is used.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Free credits per billing cycle for newly opened accounts.
    #[serde(default)]
    pub default_free_allocation: i64,
}

/// Connection settings for PostgreSQL.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(storage_err)?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| tally_core::Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Cheap connectivity probe for readiness checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn ledger(&self) -> PgLedgerStore {
        PgLedgerStore::new(self.pool.clone())
    }

    pub fn checkouts(&self) -> PgCheckoutRepository {
        PgCheckoutRepository::new(self.pool.clone())
    }

    pub fn alerts(&self) -> PgAlertLog {
        PgAlertLog::new(self.pool.clone())
    }

    pub fn leases(&self) -> PgLeaseManager {
        PgLeaseManager::new(self.pool.clone())
    }
}
