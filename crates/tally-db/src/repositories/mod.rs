//! Repository implementations for PostgreSQL.

mod alerts;
mod checkout;
mod leases;
mod ledger;

pub use alerts::PgAlertLog;
pub use checkout::PgCheckoutRepository;
pub use leases::PgLeaseManager;
pub use ledger::PgLedgerStore;

use tally_core::Error;

/// Map a driver error onto the ledger taxonomy.
///
/// Connection-level failures are reported as `StorageUnavailable` so callers
/// can retry; everything else is a plain database error.
pub(crate) fn storage_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => Error::StorageUnavailable(e.to_string()),
        other => Error::Database(other.to_string()),
    }
}
