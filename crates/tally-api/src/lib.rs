//! HTTP API server for Tally.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::{MeteringConfig, ServerConfig, Settings};
pub use error::{ApiError, ErrorBody, api_error};
pub use routes::{build_app, serve};
pub use state::{AppState, Stores};
