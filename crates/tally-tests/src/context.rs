//! PostgreSQL-backed test context.

use crate::containers::PostgresContainer;
use tally_db::{Database, DatabaseConfig};

/// A migrated database in a throwaway container. Drop to stop it.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl TestContext {
    pub async fn postgres() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(&DatabaseConfig {
            url: postgres.connection_string().to_string(),
            max_connections: 20,
            acquire_timeout_secs: 10,
        })
        .await?;
        db.migrate().await?;

        Ok(Self { postgres, db })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }
}
