//! Orphan reconciler integration tests. The background loop stays disabled;
//! tests drive passes explicitly through `reconcile_once`.

mod common;

use chrono::Utc;
use common::TestApp;
use reqwest::Client;
use simulation_service::config::{QuotaConfig, ReconcilerConfig};
use simulation_service::services::{BillingCycles, OrphanReconciler, SessionLifecycle};
use std::sync::Arc;
use uuid::Uuid;

fn build_reconciler(app: &TestApp, reconciler: ReconcilerConfig) -> OrphanReconciler {
    let db = Arc::new(app.db.clone());
    let billing = Arc::new(BillingCycles::new(db.clone()));
    let lifecycle = Arc::new(SessionLifecycle::new(db.clone(), billing, app.config.quota));
    OrphanReconciler::new(db, lifecycle, &reconciler)
}

fn stale_after(seconds: i64) -> ReconcilerConfig {
    ReconcilerConfig {
        enabled: false,
        interval_seconds: 300,
        stale_after_seconds: seconds,
        batch_size: 200,
    }
}

#[tokio::test]
async fn empty_pass_examines_nothing() {
    let app = TestApp::spawn().await;
    let reconciler = build_reconciler(&app, stale_after(21_600));

    let pass = reconciler.reconcile_once(Utc::now()).await.unwrap();
    assert_eq!(pass.examined, 0);
    assert_eq!(pass.closed, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn stale_orphan_is_closed_and_counted() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "free", 3, 0).await;

    app.start_session(&client, user_id, "mock_exam", "tok-orphan")
        .await;
    // Abandoned seven hours ago, well past both the stale cutoff and the
    // countable threshold.
    app.backdate_session("tok-orphan", 7 * 3600).await;

    let reconciler = build_reconciler(&app, stale_after(21_600));
    let pass = reconciler.reconcile_once(Utc::now()).await.unwrap();
    assert_eq!(pass.examined, 1);
    assert_eq!(pass.closed, 1);
    assert_eq!(pass.counted, 1);
    assert_eq!(app.used_count(user_id).await, 1);

    // Closed with the duration clamped to the session cap.
    let (ended, duration): (Option<chrono::DateTime<Utc>>, Option<i32>) = sqlx::query_as(
        "SELECT ended_utc, duration_seconds FROM sessions WHERE client_token = 'tok-orphan'",
    )
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert!(ended.is_some());
    assert_eq!(duration, Some(14_400));

    // A second pass finds nothing left to do.
    let again = reconciler.reconcile_once(Utc::now()).await.unwrap();
    assert_eq!(again.examined, 0);
    assert_eq!(app.used_count(user_id).await, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn short_orphan_closes_uncounted() {
    // Large countable threshold, tiny stale cutoff: the orphan is reclaimed
    // but never ran long enough to consume quota.
    let app = TestApp::spawn_with_quota(QuotaConfig {
        countable_threshold_seconds: 3_600,
        max_session_seconds: 14_400,
    })
    .await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "free", 3, 0).await;

    app.start_session(&client, user_id, "practice_exam", "tok-brief")
        .await;
    app.backdate_session("tok-brief", 120).await;

    let reconciler = build_reconciler(&app, stale_after(60));
    let pass = reconciler.reconcile_once(Utc::now()).await.unwrap();
    assert_eq!(pass.examined, 1);
    assert_eq!(pass.closed, 1);
    assert_eq!(pass.counted, 0);
    assert_eq!(app.used_count(user_id).await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn recent_open_session_is_left_alone() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "free", 3, 0).await;

    app.start_session(&client, user_id, "mock_exam", "tok-live")
        .await;

    let reconciler = build_reconciler(&app, stale_after(21_600));
    let pass = reconciler.reconcile_once(Utc::now()).await.unwrap();
    assert_eq!(pass.examined, 0);

    let (ended,): (Option<chrono::DateTime<Utc>>,) =
        sqlx::query_as("SELECT ended_utc FROM sessions WHERE client_token = 'tok-live'")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert!(ended.is_none());

    app.cleanup().await;
}

#[tokio::test]
async fn ledger_drift_is_repaired() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 10, 0).await;

    // One counted session, still open, abandoned.
    app.start_session(&client, user_id, "mock_exam", "tok-drift")
        .await;
    app.backdate_session("tok-drift", 400).await;
    client
        .post(&format!(
            "{}/api/v1/sessions/tok-drift/countable",
            app.address
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(app.used_count(user_id).await, 1);
    app.backdate_session("tok-drift", 7 * 3600).await;

    // Corrupt the ledger out from under the session log.
    sqlx::query("UPDATE quota_ledgers SET used_count = 5 WHERE user_id = $1")
        .bind(user_id)
        .execute(app.db.pool())
        .await
        .unwrap();

    let reconciler = build_reconciler(&app, stale_after(21_600));
    let pass = reconciler.reconcile_once(Utc::now()).await.unwrap();
    assert_eq!(pass.closed, 1);
    // Already counted before the pass, so not counted again.
    assert_eq!(pass.counted, 0);
    assert_eq!(pass.drift_repaired, 1);
    assert_eq!(app.used_count(user_id).await, 1);

    app.cleanup().await;
}
