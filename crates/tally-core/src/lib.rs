//! Tally Core
//!
//! Shared vocabulary for the credit ledger: identifiers, ledger and usage
//! types, the error taxonomy, domain events and the port traits implemented
//! by storage and provider adapters. This crate has minimal dependencies so
//! every other crate can depend on it.

pub mod checkout;
pub mod error;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod ports;
pub mod session;
pub mod usage;

pub use error::{Error, Result};
pub use ids::*;
