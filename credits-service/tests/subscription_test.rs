mod common;

use chrono::{Duration, Utc};
use common::{
    days_from_now, entitled_subscriber, json_body, undated_entitled_subscriber, TestApp,
};
use credits_service::models::{Plan, SubscriptionRecord, SubscriptionStatus, UserLedger};
use serde_json::json;

#[tokio::test]
async fn purchase_upgrades_plan_and_grants_capped_bonus() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;
    let purchased = Utc::now() - Duration::minutes(1);
    app.mock_subscriber(
        "alice",
        entitled_subscriber("pro_monthly", purchased, Some(days_from_now(30))),
    )
    .await;

    let response = app
        .post("/v1/subscriptions/purchase", "alice", json!({ "productId": "pro_monthly" }))
        .await;

    assert_eq!(response.status(), 200);
    let body = json_body(response).await;
    assert_eq!(body["plan"], "monthly_pro");
    assert_eq!(body["creditsGranted"], 50);
    assert!(body["expiresDate"].is_string());

    let ledger = app.repo.ledger("alice").await.unwrap();
    assert_eq!(ledger.plan, Plan::MonthlyPro);
    assert_eq!(ledger.max_credits, 100);
    assert_eq!(ledger.credits, 52);

    let record = app.repo.subscription("alice").await.unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.product_id, "pro_monthly");
    assert_eq!(record.original_transaction_id.as_deref(), Some("orig-1"));
}

#[tokio::test]
async fn replayed_purchase_grants_no_second_bonus() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;
    app.mock_subscriber(
        "alice",
        entitled_subscriber("pro_monthly", Utc::now(), Some(days_from_now(30))),
    )
    .await;
    let body = json!({ "productId": "pro_monthly" });

    let first = json_body(app.post("/v1/subscriptions/purchase", "alice", body.clone()).await).await;
    let second = json_body(app.post("/v1/subscriptions/purchase", "alice", body).await).await;

    assert_eq!(first["creditsGranted"], 50);
    assert_eq!(second["creditsGranted"], 0);
    assert_eq!(app.repo.ledger("alice").await.unwrap().credits, 52);
}

#[tokio::test]
async fn replay_without_purchase_date_grants_no_second_bonus() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;
    app.mock_subscriber(
        "alice",
        undated_entitled_subscriber("pro_monthly", days_from_now(30)),
    )
    .await;
    let body = json!({ "productId": "pro_monthly" });

    let first = json_body(app.post("/v1/subscriptions/purchase", "alice", body.clone()).await).await;
    let consumed = app
        .post("/v1/credits/consume", "alice", json!({ "amount": 10 }))
        .await;
    let second = json_body(app.post("/v1/subscriptions/purchase", "alice", body).await).await;

    assert_eq!(first["creditsGranted"], 50);
    assert_eq!(consumed.status(), 200);
    assert_eq!(second["creditsGranted"], 0);
    assert_eq!(app.repo.ledger("alice").await.unwrap().credits, 42);
}

#[tokio::test]
async fn purchase_replay_after_renewal_grants_no_bonus() {
    let app = TestApp::spawn().await;
    let now = Utc::now();
    let mut ledger = UserLedger::new_free(0, 100, now - Duration::days(31));
    ledger.plan = Plan::MonthlyPro;
    app.seed_ledger("alice", ledger).await;
    app.repo
        .insert_subscription(SubscriptionRecord {
            uid: "alice".to_string(),
            plan: Plan::MonthlyPro,
            product_id: "pro_monthly".to_string(),
            purchase_date: now - Duration::days(31),
            expires_date: now - Duration::days(1),
            original_transaction_id: Some("orig-1".to_string()),
            last_credit_grant: None,
            status: SubscriptionStatus::Active,
            updated_at: now - Duration::days(31),
        })
        .await;
    let renewed_at = now - Duration::hours(2);
    app.mock_subscriber(
        "alice",
        entitled_subscriber("pro_monthly", renewed_at, Some(days_from_now(29))),
    )
    .await;

    let report =
        json_body(app.admin_post("/internal/jobs/reconcile-subscriptions", json!({})).await).await;
    assert_eq!(report["renewed"], 1);
    let renewed_credits = app.repo.ledger("alice").await.unwrap().credits;
    assert_eq!(
        app.repo.subscription("alice").await.unwrap().purchase_date.timestamp_millis(),
        renewed_at.timestamp_millis()
    );

    let replay = json_body(
        app.post("/v1/subscriptions/purchase", "alice", json!({ "productId": "pro_monthly" }))
            .await,
    )
    .await;

    assert_eq!(replay["creditsGranted"], 0);
    assert_eq!(app.repo.ledger("alice").await.unwrap().credits, renewed_credits);
}

#[tokio::test]
async fn bonus_never_exceeds_plan_cap() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 90).await;
    app.mock_subscriber(
        "alice",
        entitled_subscriber("pro_annual", Utc::now(), Some(days_from_now(365))),
    )
    .await;

    let body = json_body(
        app.post("/v1/subscriptions/purchase", "alice", json!({ "productId": "pro_annual" }))
            .await,
    )
    .await;

    assert_eq!(body["plan"], "annual_pro");
    assert_eq!(body["creditsGranted"], 10);
    assert_eq!(app.repo.ledger("alice").await.unwrap().credits, 100);
}

#[tokio::test]
async fn restore_updates_plan_without_minting_credits() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 10).await;
    app.mock_subscriber(
        "alice",
        entitled_subscriber("pro_monthly", Utc::now() - Duration::days(3), Some(days_from_now(27))),
    )
    .await;

    let response = app
        .post("/v1/subscriptions/restore", "alice", json!({ "productId": "pro_monthly" }))
        .await;

    assert_eq!(response.status(), 200);
    let body = json_body(response).await;
    assert_eq!(body["plan"], "monthly_pro");
    assert!(body.get("creditsGranted").is_none());

    let ledger = app.repo.ledger("alice").await.unwrap();
    assert_eq!(ledger.credits, 10);
    assert_eq!(ledger.plan, Plan::MonthlyPro);
    assert_eq!(ledger.max_credits, 100);
}

#[tokio::test]
async fn expired_entitlement_is_rejected() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;
    app.mock_subscriber(
        "alice",
        entitled_subscriber("pro_monthly", Utc::now() - Duration::days(40), Some(days_from_now(-10))),
    )
    .await;

    let response = app
        .post("/v1/subscriptions/restore", "alice", json!({ "productId": "pro_monthly" }))
        .await;

    assert_eq!(response.status(), 412);
    assert_eq!(json_body(response).await["details"]["reason"], "subscription_expired");
    assert_eq!(app.repo.ledger("alice").await.unwrap().plan, Plan::Free);
}

#[tokio::test]
async fn missing_entitlement_is_no_active_subscription() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;

    let response = app
        .post("/v1/subscriptions/purchase", "alice", json!({ "productId": "pro_monthly" }))
        .await;

    assert_eq!(response.status(), 412);
    assert_eq!(json_body(response).await["details"]["reason"], "no_active_subscription");
    assert!(app.repo.subscription("alice").await.is_none());
}

#[tokio::test]
async fn lifetime_entitlement_without_expiry_is_not_accepted() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;
    app.mock_subscriber("alice", entitled_subscriber("pro_monthly", Utc::now(), None))
        .await;

    let response = app
        .post("/v1/subscriptions/restore", "alice", json!({ "productId": "pro_monthly" }))
        .await;

    assert_eq!(response.status(), 412);
    assert_eq!(json_body(response).await["details"]["reason"], "no_active_subscription");
}

#[tokio::test]
async fn unknown_subscription_product_is_invalid() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;

    let response = app
        .post("/v1/subscriptions/purchase", "alice", json!({ "productId": "credits_15" }))
        .await;

    assert_eq!(response.status(), 400);
}
