//! Billing webhook and period reset integration tests.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use reqwest::Client;
use uuid::Uuid;

fn renewal_body(event_id: &str, user_id: Uuid, start: chrono::DateTime<Utc>) -> String {
    serde_json::json!({
        "event_id": event_id,
        "event_type": "updated",
        "user_id": user_id,
        "subscription_id": "sub_123",
        "period_start": start.to_rfc3339(),
        "period_end": (start + Duration::days(30)).to_rfc3339(),
    })
    .to_string()
}

#[tokio::test]
async fn webhook_rejects_missing_signature() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .post(&format!("{}/webhooks/billing", app.address))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    app.cleanup().await;
}

#[tokio::test]
async fn webhook_rejects_invalid_signature() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .post(&format!("{}/webhooks/billing", app.address))
        .header("x-billing-signature", "deadbeef")
        .header("content-type", "application/json")
        .body(r#"{"event_id":"evt_x"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    app.cleanup().await;
}

#[tokio::test]
async fn webhook_rejects_malformed_payload() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = app.post_webhook(&client, "not json").await;
    assert_eq!(response.status(), 400);

    app.cleanup().await;
}

#[tokio::test]
async fn created_event_provisions_ledger() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    let now = Utc::now();

    let body = serde_json::json!({
        "event_id": "evt_created_1",
        "event_type": "created",
        "user_id": user_id,
        "subscription_id": "sub_new",
        "tier": "plus",
        "period_start": now.to_rfc3339(),
        "period_end": (now + Duration::days(30)).to_rfc3339(),
    })
    .to_string();

    let response = app.post_webhook(&client, &body).await;
    assert_eq!(response.status(), 200);
    let outcome: serde_json::Value = response.json().await.unwrap();
    assert_eq!(outcome["outcome"], "applied");

    let snapshot = client
        .get(&format!("{}/api/v1/users/{}/quota", app.address, user_id))
        .send()
        .await
        .unwrap();
    let quota: serde_json::Value = snapshot.json().await.unwrap();
    assert_eq!(quota["tier"], "plus");
    assert_eq!(quota["limit"], 30);
    assert_eq!(quota["used"], 0);

    app.cleanup().await;
}

#[tokio::test]
async fn renewal_resets_used_count() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 10, 7).await;

    let response = app
        .post_webhook(&client, &renewal_body("evt_renew_1", user_id, Utc::now()))
        .await;
    assert_eq!(response.status(), 200);
    let outcome: serde_json::Value = response.json().await.unwrap();
    assert_eq!(outcome["outcome"], "applied");

    assert_eq!(app.used_count(user_id).await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn replayed_event_id_is_stale_and_does_not_reset_twice() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 10, 7).await;

    let body = renewal_body("evt_renew_dup", user_id, Utc::now());

    let first = app.post_webhook(&client, &body).await;
    assert_eq!(first.status(), 200);
    assert_eq!(app.used_count(user_id).await, 0);

    // Consume a unit inside the new period, then replay the delivery.
    app.start_session(&client, user_id, "mock_exam", "tok-renew-dup")
        .await;
    app.backdate_session("tok-renew-dup", 400).await;
    client
        .post(&format!(
            "{}/api/v1/sessions/tok-renew-dup/countable",
            app.address
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(app.used_count(user_id).await, 1);

    let replay = app.post_webhook(&client, &body).await;
    assert_eq!(replay.status(), 200);
    let outcome: serde_json::Value = replay.json().await.unwrap();
    assert_eq!(outcome["outcome"], "stale");
    assert_eq!(app.used_count(user_id).await, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn failed_delivery_leaves_event_id_retryable() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 10, 7).await;

    // A renewal without period boundaries fails before any state change.
    let broken = serde_json::json!({
        "event_id": "evt_retry_1",
        "event_type": "updated",
        "user_id": user_id,
        "subscription_id": "sub_123",
        "period_start": chrono::Utc::now().to_rfc3339(),
    })
    .to_string();

    let first = app.post_webhook(&client, &broken).await;
    assert_eq!(first.status(), 400);
    assert_eq!(app.used_count(user_id).await, 7);

    // The failed delivery must not have consumed the event id.
    let (recorded,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM billing_events WHERE event_id = 'evt_retry_1'")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(recorded, 0);

    // The provider's retry under the same event id still applies.
    let retry = app
        .post_webhook(&client, &renewal_body("evt_retry_1", user_id, Utc::now()))
        .await;
    assert_eq!(retry.status(), 200);
    let outcome: serde_json::Value = retry.json().await.unwrap();
    assert_eq!(outcome["outcome"], "applied");
    assert_eq!(app.used_count(user_id).await, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn stale_period_in_fresh_event_is_not_applied() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 10, 7).await;

    // New event id, but a window older than the ledger's current one.
    let response = app
        .post_webhook(
            &client,
            &renewal_body("evt_renew_old", user_id, Utc::now() - Duration::days(90)),
        )
        .await;
    assert_eq!(response.status(), 200);
    let outcome: serde_json::Value = response.json().await.unwrap();
    assert_eq!(outcome["outcome"], "stale");
    assert_eq!(app.used_count(user_id).await, 7);

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_event_type_is_ignored() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let body = serde_json::json!({
        "event_id": "evt_odd",
        "event_type": "invoice.paid",
        "user_id": Uuid::new_v4(),
        "subscription_id": "sub_odd",
    })
    .to_string();

    let response = app.post_webhook(&client, &body).await;
    assert_eq!(response.status(), 200);
    let outcome: serde_json::Value = response.json().await.unwrap();
    assert_eq!(outcome["outcome"], "ignored");

    app.cleanup().await;
}

#[tokio::test]
async fn lazy_reset_rolls_expired_period_on_start() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    let now = Utc::now();

    // Quota exhausted, but the window expired a month ago. The renewal
    // webhook never arrived; start must roll the window itself.
    app.seed_ledger_full(
        user_id,
        "free",
        3,
        3,
        now - Duration::days(60),
        now - Duration::days(30),
        "active",
    )
    .await;

    let response = app
        .start_session(&client, user_id, "mock_exam", "tok-lazy")
        .await;
    assert_eq!(response.status(), 201);

    let snapshot = client
        .get(&format!("{}/api/v1/users/{}/quota", app.address, user_id))
        .send()
        .await
        .unwrap();
    let quota: serde_json::Value = snapshot.json().await.unwrap();
    assert_eq!(quota["used"], 0);
    let period_end: chrono::DateTime<Utc> =
        quota["period_end"].as_str().unwrap().parse().unwrap();
    assert!(period_end > now);

    app.cleanup().await;
}

#[tokio::test]
async fn cancelled_subscription_gets_no_lazy_reset() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    let now = Utc::now();

    app.seed_ledger_full(
        user_id,
        "free",
        3,
        3,
        now - Duration::days(60),
        now - Duration::days(30),
        "cancelled",
    )
    .await;

    let response = app
        .start_session(&client, user_id, "mock_exam", "tok-cancelled")
        .await;
    assert_eq!(response.status(), 403);

    app.cleanup().await;
}

#[tokio::test]
async fn cancelled_event_updates_status() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let user_id = Uuid::new_v4();
    app.seed_ledger(user_id, "standard", 10, 0).await;

    let body = serde_json::json!({
        "event_id": "evt_cancel_1",
        "event_type": "cancelled",
        "user_id": user_id,
        "subscription_id": "sub_123",
    })
    .to_string();

    let response = app.post_webhook(&client, &body).await;
    assert_eq!(response.status(), 200);
    let outcome: serde_json::Value = response.json().await.unwrap();
    assert_eq!(outcome["outcome"], "applied");

    let (status,): (String,) =
        sqlx::query_as("SELECT subscription_status FROM quota_ledgers WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(status, "cancelled");

    app.cleanup().await;
}
