//! PostgreSQL implementation of AlertLog.

use super::storage_err;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tally_core::events::BalanceStatus;
use tally_core::ids::AccountId;
use tally_core::ports::AlertLog;
use tally_core::Result;

/// PostgreSQL implementation of AlertLog.
pub struct PgAlertLog {
    pool: PgPool,
}

impl PgAlertLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertLog for PgAlertLog {
    async fn try_claim(
        &self,
        account: &AccountId,
        status: BalanceStatus,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool> {
        let claimed = sqlx::query(
            r#"INSERT INTO alert_notifications (account_id, status, notified_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (account_id, status) DO UPDATE SET notified_at = EXCLUDED.notified_at
               WHERE alert_notifications.notified_at <= $4
               RETURNING notified_at"#,
        )
        .bind(account.as_str())
        .bind(status.as_str())
        .bind(now)
        .bind(now - cooldown)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(claimed.is_some())
    }

    async fn last_notified(
        &self,
        account: &AccountId,
        status: BalanceStatus,
    ) -> Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            "SELECT notified_at FROM alert_notifications WHERE account_id = $1 AND status = $2",
        )
        .bind(account.as_str())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)
    }
}
