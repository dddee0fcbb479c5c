//! Purchases verified against a stubbed Stripe API.

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tally_api::{AppState, Stores, build_app};
use tally_billing::{StripeClient, StripeConfig};
use tally_core::ids::AccountId;
use tally_tests::{Harness, WEBHOOK_SECRET, call, post_empty, stripe_event, stripe_webhook};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn state_against(server: &MockServer) -> Arc<AppState> {
    tally_tests::init_test_logging();
    let stripe = StripeClient::new(StripeConfig::new("sk_test").with_api_url(server.uri())).unwrap();
    Arc::new(AppState::assemble(
        Stores::in_memory(Arc::new(stripe)),
        &Harness::settings(),
    ))
}

#[tokio::test]
async fn test_paid_checkout_is_fetched_once_and_credited() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/checkout/sessions/cs_stub_paid"))
        .and(header("authorization", "Bearer sk_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_stub_paid",
            "status": "complete",
            "payment_status": "paid",
            "client_reference_id": "acct_stub",
            "metadata": { "credits": "400" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    let state = state_against(&server);
    let app = build_app(state.clone());

    let (status, body) = call(
        &app,
        stripe_webhook(
            stripe_event("evt_stub_1", "checkout.session.completed", "cs_stub_paid"),
            WEBHOOK_SECRET,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["credits_added"], 400);

    let (status, poll) = call(&app, post_empty("/api/v1/checkouts/cs_stub_paid/confirm")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(poll["already_processed"], true);

    let balance = state.ledger.get_balance(&AccountId::new("acct_stub")).await.unwrap();
    assert_eq!(balance.paid_available, 400);
}

#[tokio::test]
async fn test_stripe_outage_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let app = build_app(state_against(&server));

    let (status, body) = call(&app, post_empty("/api/v1/checkouts/cs_stub_down/confirm")).await;
    assert!(status.is_server_error());
    assert_eq!(body["retryable"], true);
}
