//! Purchase confirmation across webhooks and client polls.

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use tally_core::checkout::{CheckoutStatus, ConfirmationResult};
use tally_core::ledger::{Page, TransactionType};
use tally_tests::{Harness, UsageFixture, WEBHOOK_SECRET, call, post_empty, stripe_event, stripe_webhook};

fn result_of(body: &serde_json::Value) -> ConfirmationResult {
    serde_json::from_value(body.clone()).unwrap()
}

#[tokio::test]
async fn test_two_webhooks_and_a_poll_credit_once() {
    let h = Harness::new();
    let app = h.app();
    let account = UsageFixture::account("buyer");
    h.provider.paid("cs_live_1", &account, 500);

    let (status, first) = call(
        &app,
        stripe_webhook(
            stripe_event("evt_1", "checkout.session.completed", "cs_live_1"),
            WEBHOOK_SECRET,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = call(
        &app,
        stripe_webhook(
            stripe_event("evt_1", "checkout.session.completed", "cs_live_1"),
            WEBHOOK_SECRET,
        ),
    )
    .await;
    let (status, poll) = call(&app, post_empty("/api/v1/checkouts/cs_live_1/confirm")).await;
    assert_eq!(status, StatusCode::OK);

    let first = result_of(&first["result"]);
    assert_eq!(first.status, CheckoutStatus::Success);
    assert_eq!(first.credits_added, 500);
    assert!(!first.already_processed);

    for replay in [result_of(&second["result"]), result_of(&poll)] {
        assert_eq!(
            replay,
            ConfirmationResult {
                already_processed: true,
                ..first.clone()
            }
        );
    }

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.available(&account).await, 500);
    let purchases = h
        .ledger()
        .history(&account, Page::default(), Some(TransactionType::Purchase))
        .await
        .unwrap();
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].source_event_id, "cs_live_1");
}

#[tokio::test]
async fn test_concurrent_confirmations_verify_once() {
    let h = Harness::new();
    let account = UsageFixture::account("racer");
    h.provider.paid("cs_race", &account, 200);

    let tasks = (0..8).map(|_| {
        let state = h.state.clone();
        tokio::spawn(async move { state.confirmer.confirm("cs_race").await.unwrap() })
    });
    let results: Vec<ConfirmationResult> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| !r.already_processed).count(), 1);
    assert!(results.iter().all(|r| r.credits_added == 200));
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.available(&account).await, 200);
}

#[tokio::test]
async fn test_expired_checkout_is_final_error() {
    let h = Harness::new();
    let app = h.app();
    h.provider.expired("cs_gone");

    let (status, body) = call(
        &app,
        stripe_webhook(
            stripe_event("evt_2", "checkout.session.expired", "cs_gone"),
            WEBHOOK_SECRET,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result = result_of(&body["result"]);
    assert_eq!(result.status, CheckoutStatus::Error);
    assert_eq!(result.credits_added, 0);
    assert!(result.message.is_some());

    let (_, poll) = call(&app, post_empty("/api/v1/checkouts/cs_gone/confirm")).await;
    assert!(result_of(&poll).already_processed);
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn test_pending_checkout_is_verified_again() {
    let h = Harness::new();
    let account = UsageFixture::account("slow");
    h.provider.pending("cs_slow");

    let first = h.state.confirmer.confirm("cs_slow").await.unwrap();
    assert_eq!(first.status, CheckoutStatus::Pending);
    assert_eq!(first.credits_added, 0);

    h.provider.paid("cs_slow", &account, 50);
    let second = h.state.confirmer.confirm("cs_slow").await.unwrap();
    assert_eq!(second.status, CheckoutStatus::Success);
    assert!(!second.already_processed);
    assert_eq!(h.provider.calls(), 2);
    assert_eq!(h.available(&account).await, 50);
}

#[tokio::test]
async fn test_unreachable_provider_leaves_checkout_retryable() {
    let h = Harness::new();
    let app = h.app();
    let account = UsageFixture::account("retry");
    h.provider.unreachable("cs_flaky");

    let (status, body) = call(
        &app,
        stripe_webhook(
            stripe_event("evt_3", "checkout.session.completed", "cs_flaky"),
            WEBHOOK_SECRET,
        ),
    )
    .await;
    assert!(status.is_server_error());
    assert_eq!(body["retryable"], true);

    h.provider.paid("cs_flaky", &account, 75);
    let (status, body) = call(
        &app,
        stripe_webhook(
            stripe_event("evt_3", "checkout.session.completed", "cs_flaky"),
            WEBHOOK_SECRET,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_of(&body["result"]).credits_added, 75);
    assert_eq!(h.available(&account).await, 75);
}

#[tokio::test]
async fn test_bad_signature_is_rejected_before_verification() {
    let h = Harness::new();
    let app = h.app();
    let account = UsageFixture::account("forged");
    h.provider.paid("cs_forged", &account, 1000);

    let (status, _) = call(
        &app,
        stripe_webhook(
            stripe_event("evt_4", "checkout.session.completed", "cs_forged"),
            "whsec_wrong",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn test_unrelated_event_types_are_acknowledged() {
    let h = Harness::new();
    let (status, body) = call(
        &h.app(),
        stripe_webhook(
            stripe_event("evt_5", "customer.created", "cus_1"),
            WEBHOOK_SECRET,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert!(body["result"].is_null());
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn test_malformed_checkout_id_is_bad_request() {
    let h = Harness::new();
    let (status, body) = call(&h.app(), post_empty("/api/v1/checkouts/pi_123/confirm")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retryable"], false);
    assert_eq!(h.provider.calls(), 0);
}
