//! Usage metering for Tally.
//!
//! Prices usage events with a rate card and appends one debit per event to
//! the ledger. Producers retry freely; the event ID makes resubmission a
//! no-op.

pub mod batch;
pub mod ingestor;
pub mod pricing;

pub use batch::{FlushReport, UsageBatcher};
pub use ingestor::MeteringIngestor;
pub use pricing::{Rate, RateCard};
