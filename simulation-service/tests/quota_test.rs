//! Quota enforcement and snapshot integration tests.

mod common;

use common::TestApp;
use reqwest::Client;
use uuid::Uuid;

#[tokio::test]
async fn quota_snapshot_reports_remaining() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 10, 4).await;

    let response = client
        .get(&format!("{}/api/v1/users/{}/quota", app.address, user_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["tier"], "standard");
    assert_eq!(body["used"], 4);
    assert_eq!(body["limit"], 10);
    assert_eq!(body["remaining"], 6);
    assert_eq!(body["is_unlimited"], false);

    app.cleanup().await;
}

#[tokio::test]
async fn quota_snapshot_unknown_user_returns_404() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .get(&format!(
            "{}/api/v1/users/{}/quota",
            app.address,
            Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    app.cleanup().await;
}

#[tokio::test]
async fn exhausted_quota_denies_start() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "free", 3, 3).await;

    let response = app
        .start_session(&client, user_id, "mock_exam", "tok-denied")
        .await;
    assert_eq!(response.status(), 403);

    app.cleanup().await;
}

#[tokio::test]
async fn last_quota_unit_is_usable() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "free", 3, 2).await;

    let response = app
        .start_session(&client, user_id, "mock_exam", "tok-last-unit")
        .await;
    assert_eq!(response.status(), 201);

    app.cleanup().await;
}

#[tokio::test]
async fn unlimited_tier_is_never_denied() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    // -1 is the stored unlimited sentinel; used_count is far beyond any limit.
    app.seed_ledger(user_id, "unlimited", -1, 500).await;

    let response = app
        .start_session(&client, user_id, "mock_exam", "tok-unlimited")
        .await;
    assert_eq!(response.status(), 201);

    let snapshot = client
        .get(&format!("{}/api/v1/users/{}/quota", app.address, user_id))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = snapshot.json().await.unwrap();
    assert_eq!(body["is_unlimited"], true);
    assert!(body["limit"].is_null());
    assert!(body["remaining"].is_null());

    app.cleanup().await;
}

#[tokio::test]
async fn consuming_the_last_unit_blocks_the_next_start() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 5, 4).await;

    // One unit left: start, run past the threshold, mark countable.
    let start = app.start_session(&client, user_id, "mock_exam", "t1").await;
    assert_eq!(start.status(), 201);
    app.backdate_session("t1", 400).await;
    client
        .post(&format!("{}/api/v1/sessions/t1/countable", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(app.used_count(user_id).await, 5);

    client
        .post(&format!("{}/api/v1/sessions/t1/end", app.address))
        .send()
        .await
        .unwrap();

    // Quota exhausted until the period resets.
    let denied = app.start_session(&client, user_id, "mock_exam", "t2").await;
    assert_eq!(denied.status(), 403);

    app.cleanup().await;
}

#[tokio::test]
async fn uncounted_sessions_do_not_consume_quota() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "free", 3, 0).await;

    // Three short sessions in a row; none cross the threshold.
    for i in 0..3 {
        let token = format!("tok-short-{}", i);
        let start = app
            .start_session(&client, user_id, "practice_exam", &token)
            .await;
        assert_eq!(start.status(), 201);

        let end = client
            .post(&format!("{}/api/v1/sessions/{}/end", app.address, token))
            .send()
            .await
            .unwrap();
        assert_eq!(end.status(), 200);
    }

    assert_eq!(app.used_count(user_id).await, 0);

    // A fourth start still succeeds.
    let response = app
        .start_session(&client, user_id, "mock_exam", "tok-short-3")
        .await;
    assert_eq!(response.status(), 201);

    app.cleanup().await;
}
