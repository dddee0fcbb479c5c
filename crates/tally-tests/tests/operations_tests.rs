//! Reconciliation, alerting and scheduled jobs over a shared harness.

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tally_core::events::{BalanceStatus, LedgerEvent};
use tally_core::ledger::{Page, TransactionType};
use tally_reconcile::ReconcileOutcome;
use tally_scheduler::{JobName, JobReport};
use tally_tests::{Harness, UsageFixture};

#[tokio::test]
async fn test_drifted_projection_heals_with_one_adjustment() {
    let h = Harness::new();
    let account = UsageFixture::account("drift");
    h.fund(&account, 100).await;
    h.state
        .ingestor
        .submit(&UsageFixture::call_minutes("evt-1", &account, 4))
        .await
        .unwrap();

    h.memory
        .as_ref()
        .unwrap()
        .overwrite_projection(&account, |b| {
            b.paid_available += 37;
            b.version = 99;
        })
        .await
        .unwrap();
    assert_eq!(h.available(&account).await, 117);

    let outcome = h.state.reconciler.reconcile(&account).await.unwrap();
    let ReconcileOutcome::Corrected(drift) = outcome else {
        panic!("expected a correction, got {:?}", outcome);
    };
    assert_eq!(drift.paid_delta, -37);
    assert_eq!(h.available(&account).await, 80);

    // A second pass finds nothing; the log stays the source of truth.
    assert!(matches!(
        h.state.reconciler.reconcile(&account).await.unwrap(),
        ReconcileOutcome::Clean { version: 3, .. }
    ));
    let adjustments = h
        .ledger()
        .history(&account, Page::default(), Some(TransactionType::Adjustment))
        .await
        .unwrap();
    assert_eq!(adjustments.len(), 1);
    assert!(adjustments[0].projection_only);
    assert_eq!(h.ledger().recompute_balance(&account).await.unwrap().available(), 80);
}

#[tokio::test]
async fn test_reconcile_sweep_job_covers_active_accounts() {
    let h = Harness::new();
    let clean = UsageFixture::account("clean");
    let drifted = UsageFixture::account("drifted");
    h.fund(&clean, 10).await;
    h.fund(&drifted, 10).await;
    h.memory
        .as_ref()
        .unwrap()
        .overwrite_projection(&drifted, |b| b.free_available = 3)
        .await
        .unwrap();

    let JobReport::ReconcileSweep(summary) = h.state.jobs.run(JobName::ReconcileSweep).await.unwrap() else {
        panic!("wrong report");
    };
    assert_eq!(summary.clean, 1);
    assert_eq!(summary.corrected, 1);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_alert_sweep_notifies_once_per_cooldown() {
    let h = Harness::new();
    let account = UsageFixture::account("low");
    let mut events = h.state.event_bus.subscribe().await.unwrap();
    h.fund(&account, 30).await;
    h.state
        .ingestor
        .submit(&UsageFixture::call_minutes("evt-1", &account, 3))
        .await
        .unwrap();

    let JobReport::AlertSweep(first) = h.state.jobs.run(JobName::AlertSweep).await.unwrap() else {
        panic!("wrong report");
    };
    assert_eq!(first.notified, 1);

    // More usage in the same band is suppressed by the cool-down.
    h.state
        .ingestor
        .submit(&UsageFixture::one_credit("evt-2", &account))
        .await
        .unwrap();
    let JobReport::AlertSweep(second) = h.state.jobs.run(JobName::AlertSweep).await.unwrap() else {
        panic!("wrong report");
    };
    assert_eq!(second.evaluated, 1);
    assert_eq!(second.notified, 0);

    let alert = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(event) = events.next().await {
            if let LedgerEvent::BalanceAlert(payload) = event {
                return Some(payload);
            }
        }
        None
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(alert.account_id, account);
    assert_eq!(alert.status, BalanceStatus::Critical);
    assert_eq!(alert.available, 15);
}

#[tokio::test]
async fn test_usage_flush_job_applies_queued_events() {
    let h = Harness::new();
    let account = UsageFixture::account("batched");
    h.fund(&account, 20).await;
    for i in 0..3 {
        h.state
            .batcher
            .enqueue(UsageFixture::one_credit(format!("evt-{}", i), &account))
            .await
            .unwrap();
    }
    // Redelivery of an event already queued.
    h.state
        .batcher
        .enqueue(UsageFixture::one_credit("evt-0", &account))
        .await
        .unwrap();

    let JobReport::UsageFlush(report) = h.state.jobs.run(JobName::UsageFlush).await.unwrap() else {
        panic!("wrong report");
    };
    assert_eq!(report.applied, 3);
    assert_eq!(report.duplicates, 1);
    assert_eq!(h.available(&account).await, 17);
    assert_eq!(h.state.batcher.pending().await, 0);
}

#[tokio::test]
async fn test_free_renewal_tops_up_once_per_month() {
    let h = Harness::new();
    let account = UsageFixture::account("free");
    h.ledger().ensure_account(&account, 100).await.unwrap();
    let march = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();

    let JobReport::FreeRenewal(first) = h.state.jobs.run_at(JobName::FreeRenewal, march).await.unwrap() else {
        panic!("wrong report");
    };
    assert_eq!(first.period, "2026-03");
    assert_eq!(first.credits, 100);
    assert_eq!(h.available(&account).await, 100);

    h.state
        .ingestor
        .submit(&UsageFixture::call_minutes("evt-1", &account, 6))
        .await
        .unwrap();
    let balance = h.ledger().get_balance(&account).await.unwrap();
    assert_eq!(balance.free_available, 70);

    // Same period: the grant key already exists.
    let JobReport::FreeRenewal(again) = h.state.jobs.run_at(JobName::FreeRenewal, march).await.unwrap() else {
        panic!("wrong report");
    };
    assert_eq!(again.granted, 0);
    assert_eq!(again.unchanged, 1);
    assert_eq!(h.available(&account).await, 70);

    let JobReport::FreeRenewal(next) = h.state.jobs.run_at(JobName::FreeRenewal, april).await.unwrap() else {
        panic!("wrong report");
    };
    assert_eq!(next.granted, 1);
    assert_eq!(next.credits, 30);
    assert_eq!(h.available(&account).await, 100);
}
