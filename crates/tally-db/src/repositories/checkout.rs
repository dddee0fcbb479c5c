//! PostgreSQL implementation of CheckoutRepository.

use super::storage_err;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tally_core::checkout::{CheckoutConfirmation, CheckoutStatus};
use tally_core::ids::{AccountId, TransactionId};
use tally_core::ports::CheckoutRepository;
use tally_core::Result;

const COLUMNS: &str =
    "checkout_id, account_id, status, credits_added, transaction_id, error, created_at, updated_at";

/// PostgreSQL implementation of CheckoutRepository.
pub struct PgCheckoutRepository {
    pool: PgPool,
}

impl PgCheckoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_confirmation(r: &PgRow) -> CheckoutConfirmation {
        let status: String = r.get("status");
        CheckoutConfirmation {
            checkout_id: r.get("checkout_id"),
            account_id: r.get::<Option<String>, _>("account_id").map(AccountId::new),
            status: CheckoutStatus::parse(&status),
            credits_added: r.get("credits_added"),
            transaction_id: r
                .get::<Option<uuid::Uuid>, _>("transaction_id")
                .map(TransactionId::from_uuid),
            error: r.get("error"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }
    }
}

#[async_trait]
impl CheckoutRepository for PgCheckoutRepository {
    async fn get(&self, checkout_id: &str) -> Result<Option<CheckoutConfirmation>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM checkout_confirmations WHERE checkout_id = $1"
        ))
        .bind(checkout_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.as_ref().map(Self::row_to_confirmation))
    }

    async fn save(&self, confirmation: &CheckoutConfirmation) -> Result<CheckoutConfirmation> {
        // Only pending rows are updated; a resolved record wins over any
        // later write and is returned as-is.
        let row = sqlx::query(&format!(
            r#"INSERT INTO checkout_confirmations ({COLUMNS})
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (checkout_id) DO UPDATE SET
                   account_id = EXCLUDED.account_id,
                   status = EXCLUDED.status,
                   credits_added = EXCLUDED.credits_added,
                   transaction_id = EXCLUDED.transaction_id,
                   error = EXCLUDED.error,
                   updated_at = EXCLUDED.updated_at
               WHERE checkout_confirmations.status = 'pending'
               RETURNING {COLUMNS}"#
        ))
        .bind(&confirmation.checkout_id)
        .bind(confirmation.account_id.as_ref().map(|a| a.as_str()))
        .bind(confirmation.status.as_str())
        .bind(confirmation.credits_added)
        .bind(confirmation.transaction_id.map(|t| *t.as_uuid()))
        .bind(&confirmation.error)
        .bind(confirmation.created_at)
        .bind(confirmation.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(r) => Ok(Self::row_to_confirmation(&r)),
            None => self.get(&confirmation.checkout_id).await?.ok_or_else(|| {
                tally_core::Error::Internal(format!(
                    "checkout {} vanished during save",
                    confirmation.checkout_id
                ))
            }),
        }
    }
}
