//! Request handlers organized by resource.

pub mod accounts;
pub mod admission;
pub mod checkout;
pub mod health;
pub mod jobs;
pub mod sessions;
pub mod usage;
