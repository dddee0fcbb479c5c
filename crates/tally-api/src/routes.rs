//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::handlers::{accounts, admission, checkout, health, jobs, sessions, usage};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .with_state(state)
}

/// The router with request IDs, tracing and CORS applied.
pub fn build_app(state: Arc<AppState>) -> Router {
    create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .layer(axum_middleware::from_fn(request_id))
}

/// Serve `app` until `shutdown` resolves.
pub async fn serve(
    app: Router,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = config
        .addr()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/accounts", account_routes())
        .nest("/sessions", session_routes())
        .route("/estimate", post(admission::estimate))
        .route("/usage", post(usage::submit))
        .route("/usage/batch", post(usage::enqueue))
        .route("/checkouts/{checkout_id}/confirm", post(checkout::confirm))
        .route("/webhooks/stripe", post(checkout::stripe_webhook))
        .route("/jobs/{name}/run", post(jobs::run_job))
}

fn account_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{account_id}", post(accounts::open_account))
        .route("/{account_id}/balance", get(accounts::get_balance))
        .route("/{account_id}/transactions", get(accounts::list_transactions))
        .route("/{account_id}/admit", post(admission::admit))
        .route("/{account_id}/sessions", get(sessions::list_sessions))
        .route("/{account_id}/reconcile", post(jobs::reconcile_account))
}

fn session_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(sessions::open_session))
        .route("/{id}", get(sessions::get_session))
        .route("/{id}/start", post(sessions::start_session))
        .route("/{id}/degrade", post(sessions::degrade_session))
        .route("/{id}/complete", post(sessions::complete_session))
}
