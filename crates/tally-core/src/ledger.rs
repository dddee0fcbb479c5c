//! Ledger types: transactions, the balance projection and append requests.
//!
//! Credits are exact integers. Every transaction records how its signed
//! `amount` splits across the free and paid buckets, so a balance can be
//! rebuilt from the log without interpreting descriptions.

use crate::ids::{AccountId, TransactionId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits bought through the payment provider.
    Purchase,
    /// Credits consumed by metered services.
    Usage,
    /// Credits returned to the account.
    Refund,
    /// Operator or reconciliation correction.
    Adjustment,
    /// Credits removed because they lapsed.
    Expiration,
    /// Free credits granted for a billing cycle.
    Grant,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Usage => "usage",
            TransactionType::Refund => "refund",
            TransactionType::Adjustment => "adjustment",
            TransactionType::Expiration => "expiration",
            TransactionType::Grant => "grant",
        }
    }

    /// Check the sign of an amount against this type.
    fn accepts(&self, amount: i64) -> bool {
        match self {
            TransactionType::Purchase | TransactionType::Refund | TransactionType::Grant => {
                amount > 0
            }
            TransactionType::Usage | TransactionType::Expiration => amount < 0,
            TransactionType::Adjustment => amount != 0,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "purchase" => Ok(TransactionType::Purchase),
            "usage" => Ok(TransactionType::Usage),
            "refund" => Ok(TransactionType::Refund),
            "adjustment" => Ok(TransactionType::Adjustment),
            "expiration" => Ok(TransactionType::Expiration),
            "grant" => Ok(TransactionType::Grant),
            other => Err(Error::InvalidInput(format!(
                "Unknown transaction type: {}",
                other
            ))),
        }
    }
}

/// How an amount is divided between the free and paid buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Allocation {
    /// Debits draw free credits before paid ones; credits refill free
    /// credits up to the allocation before paid ones.
    FreeFirst,
    Free,
    Paid,
    Explicit { free: i64, paid: i64 },
}

/// Request to append a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransactionInput {
    pub account_id: AccountId,
    pub tx_type: TransactionType,
    pub amount: i64,
    pub allocation: Allocation,
    /// Idempotency key, unique per account.
    pub source_event_id: String,
    pub description: String,
    /// Reject the append if available credits would end below this value.
    #[serde(default)]
    pub floor: Option<i64>,
}

impl CreditTransactionInput {
    pub fn purchase(
        account_id: AccountId,
        credits: i64,
        checkout_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            tx_type: TransactionType::Purchase,
            amount: credits,
            allocation: Allocation::Paid,
            source_event_id: checkout_id.into(),
            description: description.into(),
            floor: None,
        }
    }

    /// A usage debit. `debit` is the positive number of credits consumed.
    pub fn usage(
        account_id: AccountId,
        debit: i64,
        event_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            tx_type: TransactionType::Usage,
            amount: -debit,
            allocation: Allocation::FreeFirst,
            source_event_id: event_id.into(),
            description: description.into(),
            floor: None,
        }
    }

    pub fn grant(
        account_id: AccountId,
        credits: i64,
        key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            tx_type: TransactionType::Grant,
            amount: credits,
            allocation: Allocation::Free,
            source_event_id: key.into(),
            description: description.into(),
            floor: None,
        }
    }

    pub fn refund(
        account_id: AccountId,
        credits: i64,
        key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            tx_type: TransactionType::Refund,
            amount: credits,
            allocation: Allocation::FreeFirst,
            source_event_id: key.into(),
            description: description.into(),
            floor: None,
        }
    }

    pub fn expiration(
        account_id: AccountId,
        credits: i64,
        allocation: Allocation,
        key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            tx_type: TransactionType::Expiration,
            amount: -credits,
            allocation,
            source_event_id: key.into(),
            description: description.into(),
            floor: None,
        }
    }

    pub fn adjustment(
        account_id: AccountId,
        free: i64,
        paid: i64,
        key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            tx_type: TransactionType::Adjustment,
            amount: free + paid,
            allocation: Allocation::Explicit { free, paid },
            source_event_id: key.into(),
            description: description.into(),
            floor: None,
        }
    }

    /// Gate the append on the resulting available balance.
    pub fn with_floor(mut self, floor: i64) -> Self {
        self.floor = Some(floor);
        self
    }

    /// Validate shape before touching storage.
    pub fn validate(&self) -> Result<()> {
        if self.source_event_id.trim().is_empty() {
            return Err(Error::InvalidTransaction(
                "source_event_id must not be empty".to_string(),
            ));
        }
        if !self.tx_type.accepts(self.amount) {
            return Err(Error::InvalidTransaction(format!(
                "{} amount {} has the wrong sign",
                self.tx_type, self.amount
            )));
        }
        if let Allocation::Explicit { free, paid } = self.allocation
            && free + paid != self.amount
        {
            return Err(Error::InvalidTransaction(format!(
                "split {} + {} does not sum to {}",
                free, paid, self.amount
            )));
        }
        Ok(())
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreditTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub tx_type: TransactionType,
    pub amount: i64,
    pub free_amount: i64,
    pub paid_amount: i64,
    /// Audit snapshot of available credits after this entry. Not authoritative.
    pub balance_after: i64,
    pub source_event_id: String,
    pub description: String,
    /// Records a repair of the cached projection rather than a ledger
    /// movement. Excluded when folding the log.
    #[serde(default)]
    pub projection_only: bool,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Build the entry for a validated input whose split is already resolved.
    pub fn from_input(
        input: &CreditTransactionInput,
        free_amount: i64,
        paid_amount: i64,
        balance_after: i64,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            account_id: input.account_id.clone(),
            tx_type: input.tx_type,
            amount: input.amount,
            free_amount,
            paid_amount,
            balance_after,
            source_event_id: input.source_event_id.clone(),
            description: input.description.clone(),
            projection_only: false,
            created_at: Utc::now(),
        }
    }

    /// Whether this entry moves credits in the ledger.
    pub fn is_ledger_effective(&self) -> bool {
        !self.projection_only
    }
}

/// Outcome of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    /// A new transaction was written.
    Recorded(CreditTransaction),
    /// The idempotency key was already used; this is the original entry.
    Duplicate(CreditTransaction),
}

impl Appended {
    pub fn transaction(&self) -> &CreditTransaction {
        match self {
            Appended::Recorded(tx) | Appended::Duplicate(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> CreditTransaction {
        match self {
            Appended::Recorded(tx) | Appended::Duplicate(tx) => tx,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Appended::Duplicate(_))
    }
}

/// Cached balance projection for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreditBalance {
    pub account_id: AccountId,
    /// Free credits granted per billing cycle.
    pub free_allocation: i64,
    pub free_available: i64,
    pub paid_available: i64,
    pub total_purchased: i64,
    pub total_used: i64,
    /// Incremented by every append.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl CreditBalance {
    pub fn new(account_id: AccountId, free_allocation: i64) -> Self {
        Self {
            account_id,
            free_allocation,
            free_available: 0,
            paid_available: 0,
            total_purchased: 0,
            total_used: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Credits usable right now, free and paid combined.
    pub fn available(&self) -> i64 {
        self.free_available + self.paid_available
    }

    /// Resolve how `amount` splits into (free, paid) against this balance.
    pub fn split(&self, allocation: Allocation, amount: i64) -> Result<(i64, i64)> {
        match allocation {
            Allocation::Paid => Ok((0, amount)),
            Allocation::Explicit { free, paid } => Ok((free, paid)),
            Allocation::Free => {
                let after = self.free_available + amount;
                if amount > 0 && after > self.free_allocation {
                    return Err(Error::InvalidTransaction(format!(
                        "free credits would exceed the allocation of {}",
                        self.free_allocation
                    )));
                }
                if amount < 0 && after < 0 {
                    return Err(Error::InvalidTransaction(format!(
                        "only {} free credits available",
                        self.free_available
                    )));
                }
                Ok((amount, 0))
            }
            Allocation::FreeFirst if amount < 0 => {
                let debit = -amount;
                let from_free = debit.min(self.free_available.max(0));
                Ok((-from_free, -(debit - from_free)))
            }
            Allocation::FreeFirst => {
                let headroom = (self.free_allocation - self.free_available).max(0);
                let to_free = amount.min(headroom);
                Ok((to_free, amount - to_free))
            }
        }
    }

    /// Apply one ledger-effective movement to the projection.
    pub fn apply(&mut self, tx_type: TransactionType, amount: i64, free: i64, paid: i64) {
        self.free_available += free;
        self.paid_available += paid;
        match tx_type {
            TransactionType::Purchase => self.total_purchased += amount,
            TransactionType::Usage => self.total_used -= amount,
            _ => {}
        }
    }

    /// Rebuild a balance from the full log.
    ///
    /// The returned version is the number of entries in the log, which is
    /// what the cached version reaches when every write went through append.
    pub fn fold<'a>(
        account_id: AccountId,
        free_allocation: i64,
        transactions: impl IntoIterator<Item = &'a CreditTransaction>,
    ) -> Self {
        let mut balance = Self::new(account_id, free_allocation);
        let mut latest: Option<DateTime<Utc>> = None;
        for tx in transactions {
            balance.version += 1;
            if tx.is_ledger_effective() {
                balance.apply(tx.tx_type, tx.amount, tx.free_amount, tx.paid_amount);
            }
            latest = Some(latest.map_or(tx.created_at, |t| t.max(tx.created_at)));
        }
        if let Some(at) = latest {
            balance.updated_at = at;
        }
        balance
    }

    /// Compare the credit-bearing fields of two projections.
    pub fn same_amounts(&self, other: &CreditBalance) -> bool {
        self.free_available == other.free_available
            && self.paid_available == other.paid_available
            && self.total_purchased == other.total_purchased
            && self.total_used == other.total_used
    }
}

/// Pagination window for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 500;

    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}
