//! Ledger properties exercised through the metering ingestor.

use futures::future::join_all;
use pretty_assertions::assert_eq;
use tally_api::Settings;
use tally_core::ledger::{Page, TransactionType};
use tally_core::usage::{RejectReason, SubmitOutcome};
use tally_tests::{Harness, UsageFixture};

#[tokio::test]
async fn test_same_event_applies_once() {
    let h = Harness::new();
    let account = UsageFixture::account("dup");
    h.fund(&account, 100).await;

    let event = UsageFixture::call_minutes("evt-call-1", &account, 3);
    let mut applied = 0;
    for _ in 0..5 {
        match h.state.ingestor.submit(&event).await.unwrap() {
            SubmitOutcome::Applied { debit, .. } => {
                assert_eq!(debit, 15);
                applied += 1;
            }
            SubmitOutcome::Duplicate { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.available(&account).await, 85);
    let usage = h
        .ledger()
        .history(&account, Page::default(), Some(TransactionType::Usage))
        .await
        .unwrap();
    assert_eq!(usage.len(), 1);
}

#[tokio::test]
async fn test_projection_equals_signed_sum_of_log() {
    let h = Harness::new();
    let account = UsageFixture::account("sum");
    h.fund(&account, 40).await;
    h.fund(&account, 25).await;
    for i in 0..7 {
        let event = UsageFixture::call_minutes(&format!("evt-{}", i), &account, 2);
        h.state.ingestor.submit(&event).await.unwrap();
    }

    let log = h
        .ledger()
        .history(&account, Page::new(500, 0), None)
        .await
        .unwrap();
    let signed_sum: i64 = log.iter().map(|tx| tx.amount).sum();
    let cached = h.ledger().get_balance(&account).await.unwrap();
    let derived = h.ledger().recompute_balance(&account).await.unwrap();

    assert_eq!(signed_sum, -5);
    assert_eq!(cached.available(), signed_sum);
    assert!(cached.same_amounts(&derived));
    assert_eq!(cached.version, log.len() as u64);
    assert_eq!(derived.version, cached.version);
}

#[tokio::test]
async fn test_concurrent_gated_debits_stop_at_floor() {
    let h = Harness::with_settings(Settings {
        metering: tally_api::MeteringConfig {
            floor: Some(0),
            ..Default::default()
        },
        ..Harness::settings()
    });
    let account = UsageFixture::account("gated");
    h.fund(&account, 100).await;

    let submissions = (0..120).map(|i| {
        let state = h.state.clone();
        let event = UsageFixture::one_credit(format!("evt-{}", i), &account);
        tokio::spawn(async move { state.ingestor.submit(&event).await.unwrap() })
    });
    let outcomes: Vec<SubmitOutcome> = join_all(submissions)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, SubmitOutcome::Applied { .. }))
        .count();
    let refused = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                SubmitOutcome::Rejected {
                    reason: RejectReason::InsufficientCredits { .. }
                }
            )
        })
        .count();

    assert_eq!(applied, 100);
    assert_eq!(refused, 20);
    assert_eq!(h.available(&account).await, 0);
}

#[tokio::test]
async fn test_concurrent_ungated_debits_all_land() {
    let h = Harness::new();
    let account = UsageFixture::account("ungated");
    h.fund(&account, 100).await;

    let submissions = (0..100).map(|i| {
        let state = h.state.clone();
        let event = UsageFixture::one_credit(format!("evt-{}", i), &account);
        tokio::spawn(async move { state.ingestor.submit(&event).await.unwrap() })
    });
    for outcome in join_all(submissions).await {
        assert!(matches!(outcome.unwrap(), SubmitOutcome::Applied { .. }));
    }

    let balance = h.ledger().get_balance(&account).await.unwrap();
    assert_eq!(balance.available(), 0);
    assert_eq!(balance.total_used, 100);
    // One purchase plus one row per debit.
    assert_eq!(balance.version, 101);
    let usage = h
        .ledger()
        .history(&account, Page::new(500, 0), Some(TransactionType::Usage))
        .await
        .unwrap();
    assert_eq!(usage.len(), 100);
}

#[tokio::test]
async fn test_ungated_usage_overdraws() {
    let h = Harness::new();
    let account = UsageFixture::account("overdraw");
    h.fund(&account, 10).await;

    let outcome = h
        .state
        .ingestor
        .submit(&UsageFixture::call_minutes("evt-long", &account, 4))
        .await
        .unwrap();

    assert!(matches!(outcome, SubmitOutcome::Applied { balance_after: -10, .. }));
    assert_eq!(h.available(&account).await, -10);
}

#[tokio::test]
async fn test_unknown_service_is_rejected_without_a_row() {
    let h = Harness::new();
    let account = UsageFixture::account("unknown");
    h.fund(&account, 10).await;

    let event = tally_core::usage::UsageEvent::new("evt-x", account.clone(), "teleportation", 1);
    let outcome = h.state.ingestor.submit(&event).await.unwrap();

    assert_eq!(
        outcome,
        SubmitOutcome::Rejected {
            reason: RejectReason::UnknownService {
                service: "teleportation".to_string()
            }
        }
    );
    assert_eq!(h.ledger().get_balance(&account).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_storage_outage_writes_nothing_and_retry_applies() {
    let h = Harness::new();
    let account = UsageFixture::account("outage");
    h.fund(&account, 50).await;
    let memory = h.memory.clone().unwrap();
    let event = UsageFixture::call_minutes("evt-retry", &account, 1);

    memory.set_available(false);
    assert!(h.state.ingestor.submit(&event).await.is_err());
    memory.set_available(true);

    assert_eq!(h.available(&account).await, 50);
    assert!(matches!(
        h.state.ingestor.submit(&event).await.unwrap(),
        SubmitOutcome::Applied { .. }
    ));
    assert_eq!(h.available(&account).await, 45);
}
