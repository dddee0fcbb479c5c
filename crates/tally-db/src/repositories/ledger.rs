//! PostgreSQL implementation of LedgerStore.
//!
//! Every append runs in one transaction that locks the account's balance
//! row first. The idempotency check, the floor check, the log insert and the
//! projection update all happen under that lock, so concurrent appends to
//! one account serialize while different accounts proceed in parallel.

use super::storage_err;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tally_core::ids::{AccountId, TransactionId};
use tally_core::ledger::{
    Appended, CreditBalance, CreditTransaction, CreditTransactionInput, Page, TransactionType,
};
use tally_core::ports::LedgerStore;
use tally_core::{Error, Result};
use tracing::{debug, info};

const BALANCE_COLUMNS: &str = "account_id, free_allocation, free_available, paid_available, total_purchased, total_used, version, updated_at";

const TRANSACTION_COLUMNS: &str = "id, account_id, tx_type, amount, free_amount, paid_amount, balance_after, source_event_id, description, projection_only, created_at";

/// PostgreSQL implementation of LedgerStore.
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_balance(r: &PgRow) -> CreditBalance {
        CreditBalance {
            account_id: AccountId::new(r.get::<String, _>("account_id")),
            free_allocation: r.get("free_allocation"),
            free_available: r.get("free_available"),
            paid_available: r.get("paid_available"),
            total_purchased: r.get("total_purchased"),
            total_used: r.get("total_used"),
            version: r.get::<i64, _>("version") as u64,
            updated_at: r.get("updated_at"),
        }
    }

    fn row_to_transaction(r: &PgRow) -> Result<CreditTransaction> {
        let tx_type: String = r.get("tx_type");
        Ok(CreditTransaction {
            id: TransactionId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            account_id: AccountId::new(r.get::<String, _>("account_id")),
            tx_type: tx_type.parse()?,
            amount: r.get("amount"),
            free_amount: r.get("free_amount"),
            paid_amount: r.get("paid_amount"),
            balance_after: r.get("balance_after"),
            source_event_id: r.get("source_event_id"),
            description: r.get("description"),
            projection_only: r.get("projection_only"),
            created_at: r.get("created_at"),
        })
    }

    /// Lock the balance row for the rest of `tx`, creating it if needed.
    async fn lock_balance(
        tx: &mut Transaction<'_, Postgres>,
        account: &AccountId,
        create: bool,
    ) -> Result<Option<CreditBalance>> {
        if create {
            sqlx::query(
                "INSERT INTO credit_balances (account_id) VALUES ($1) ON CONFLICT (account_id) DO NOTHING",
            )
            .bind(account.as_str())
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }

        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM credit_balances WHERE account_id = $1 FOR UPDATE"
        ))
        .bind(account.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_err)?;

        Ok(row.as_ref().map(Self::row_to_balance))
    }

    async fn insert_transaction(
        tx: &mut Transaction<'_, Postgres>,
        record: &CreditTransaction,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO credit_transactions ({TRANSACTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(record.id.as_uuid())
        .bind(record.account_id.as_str())
        .bind(record.tx_type.as_str())
        .bind(record.amount)
        .bind(record.free_amount)
        .bind(record.paid_amount)
        .bind(record.balance_after)
        .bind(&record.source_event_id)
        .bind(&record.description)
        .bind(record.projection_only)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn store_projection(
        tx: &mut Transaction<'_, Postgres>,
        balance: &CreditBalance,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE credit_balances
               SET free_available = $2, paid_available = $3, total_purchased = $4,
                   total_used = $5, version = version + 1, updated_at = NOW()
               WHERE account_id = $1"#,
        )
        .bind(balance.account_id.as_str())
        .bind(balance.free_available)
        .bind(balance.paid_available)
        .bind(balance.total_purchased)
        .bind(balance.total_used)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_account(&self, account: &AccountId, free_allocation: i64) -> Result<CreditBalance> {
        if free_allocation < 0 {
            return Err(Error::InvalidInput(
                "free allocation must not be negative".to_string(),
            ));
        }

        let row = sqlx::query(&format!(
            r#"INSERT INTO credit_balances (account_id, free_allocation) VALUES ($1, $2)
               ON CONFLICT (account_id) DO UPDATE SET free_allocation = EXCLUDED.free_allocation
               RETURNING {BALANCE_COLUMNS}"#
        ))
        .bind(account.as_str())
        .bind(free_allocation)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(Self::row_to_balance(&row))
    }

    async fn append(&self, input: CreditTransactionInput) -> Result<Appended> {
        input.validate()?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut balance = Self::lock_balance(&mut tx, &input.account_id, true)
            .await?
            .ok_or_else(|| Error::AccountNotFound(input.account_id.clone()))?;

        // The key check runs under the row lock, so two racing appends with
        // the same key cannot both get past it.
        let existing = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE account_id = $1 AND source_event_id = $2"
        ))
        .bind(input.account_id.as_str())
        .bind(&input.source_event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        if let Some(row) = existing {
            let original = Self::row_to_transaction(&row)?;
            tx.rollback().await.map_err(storage_err)?;
            debug!(
                account = %input.account_id,
                source_event_id = %input.source_event_id,
                "Duplicate append ignored"
            );
            return Ok(Appended::Duplicate(original));
        }

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
        let record = CreditTransaction::from_input(&input, free, paid, balance.available());

        Self::insert_transaction(&mut tx, &record).await?;
        Self::store_projection(&mut tx, &balance).await?;
        tx.commit().await.map_err(storage_err)?;

        debug!(
            account = %record.account_id,
            transaction_id = %record.id,
            tx_type = %record.tx_type,
            amount = record.amount,
            balance_after = record.balance_after,
            "Transaction appended"
        );

        Ok(Appended::Recorded(record))
    }

    async fn get_balance(&self, account: &AccountId) -> Result<CreditBalance> {
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM credit_balances WHERE account_id = $1"
        ))
        .bind(account.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref()
            .map(Self::row_to_balance)
            .ok_or_else(|| Error::AccountNotFound(account.clone()))
    }

    async fn recompute_balance(&self, account: &AccountId) -> Result<CreditBalance> {
        let allocation: Option<i64> =
            sqlx::query_scalar("SELECT free_allocation FROM credit_balances WHERE account_id = $1")
                .bind(account.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        let allocation = allocation.ok_or_else(|| Error::AccountNotFound(account.clone()))?;

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE account_id = $1 ORDER BY created_at, id"
        ))
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let transactions = rows
            .iter()
            .map(Self::row_to_transaction)
            .collect::<Result<Vec<_>>>()?;

        Ok(CreditBalance::fold(account.clone(), allocation, &transactions))
    }

    async fn correct_projection(
        &self,
        derived: &CreditBalance,
        expected_version: u64,
        description: &str,
    ) -> Result<CreditTransaction> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let cached = Self::lock_balance(&mut tx, &derived.account_id, false)
            .await?
            .ok_or_else(|| Error::AccountNotFound(derived.account_id.clone()))?;

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

        Self::insert_transaction(&mut tx, &record).await?;
        // The version is reset to the log length, correction included, so a
        // damaged version heals along with the amounts.
        sqlx::query(
            r#"UPDATE credit_balances
               SET free_available = $2, paid_available = $3, total_purchased = $4,
                   total_used = $5, version = $6, updated_at = NOW()
               WHERE account_id = $1"#,
        )
        .bind(derived.account_id.as_str())
        .bind(derived.free_available)
        .bind(derived.paid_available)
        .bind(derived.total_purchased)
        .bind(derived.total_used)
        .bind((derived.version + 1) as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        info!(
            account = %record.account_id,
            correction_id = %record.id,
            free_delta,
            paid_delta,
            "Balance projection corrected"
        );

        Ok(record)
    }

    async fn history(
        &self,
        account: &AccountId,
        page: Page,
        filter: Option<TransactionType>,
    ) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {TRANSACTION_COLUMNS} FROM credit_transactions
               WHERE account_id = $1 AND ($2::TEXT IS NULL OR tx_type = $2)
               ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"#
        ))
        .bind(account.as_str())
        .bind(filter.map(|t| t.as_str()))
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn find_by_source(
        &self,
        account: &AccountId,
        source_event_id: &str,
    ) -> Result<Option<CreditTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE account_id = $1 AND source_event_id = $2"
        ))
        .bind(account.as_str())
        .bind(source_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn accounts_active_since(&self, since: DateTime<Utc>) -> Result<Vec<AccountId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT account_id FROM credit_transactions WHERE created_at >= $1 ORDER BY account_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(ids.into_iter().map(AccountId::new).collect())
    }

    async fn list_accounts(&self) -> Result<Vec<AccountId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT account_id FROM credit_balances ORDER BY account_id")
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;

        Ok(ids.into_iter().map(AccountId::new).collect())
    }
}
