//! Test infrastructure for Tally.
//!
//! Behavioural tests run against [`Harness`], which wires every component
//! over in-process storage. Tests behind the `integration` feature run the
//! same scenarios against PostgreSQL in a container.
//!
//! ```ignore
//! let h = Harness::new();
//! h.fund(&account, 100).await;
//! let outcome = h.state.ingestor.submit(&usage).await?;
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod harness;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use harness::Harness;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,tally_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
