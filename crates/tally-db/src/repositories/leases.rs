//! PostgreSQL implementation of LeaseManager.

use super::storage_err;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tally_core::ids::AccountId;
use tally_core::ports::LeaseManager;
use tally_core::Result;

/// Leases stored in `account_leases`. An expired lease can be taken over by
/// any holder; a live one only renewed by its owner.
pub struct PgLeaseManager {
    pool: PgPool,
}

impl PgLeaseManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseManager for PgLeaseManager {
    async fn try_acquire(&self, account: &AccountId, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let acquired = sqlx::query(
            r#"INSERT INTO account_leases (account_id, holder, expires_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (account_id) DO UPDATE SET
                   holder = EXCLUDED.holder,
                   expires_at = EXCLUDED.expires_at
               WHERE account_leases.expires_at < $4 OR account_leases.holder = EXCLUDED.holder
               RETURNING holder"#,
        )
        .bind(account.as_str())
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(acquired.is_some())
    }

    async fn release(&self, account: &AccountId, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM account_leases WHERE account_id = $1 AND holder = $2")
            .bind(account.as_str())
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
