mod common;

use chrono::{Duration, Utc};
use common::{json_body, TestApp};
use credits_service::models::UserLedger;
use credits_service::services::generator::MockBehavior;
use credits_service::services::slots::RateLimitPolicy;
use credits_service::services::{CreditError, InMemoryLedgerRepository, RateLimitReason, SlotManager};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn successful_generation_charges_and_starts_cooldown() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;

    let response = app
        .post("/v1/generations", "alice", json!({ "prompt": "a red fox" }))
        .await;

    assert_eq!(response.status(), 200);
    let body = json_body(response).await;
    assert_eq!(body["mimeType"], "image/png");
    assert_eq!(body["imageBase64"], "mock-image:a red fox");
    assert_eq!(body["remainingCredits"], 1);

    let ledger = app.repo.ledger("alice").await.unwrap();
    assert_eq!(ledger.credits, 1);
    assert_eq!(ledger.active_generations, 0);
    assert!(ledger.last_generation_at.is_some());
}

#[tokio::test]
async fn failed_generation_releases_slot_without_charging() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;
    app.generator.set_behavior(MockBehavior::Fail);

    let response = app
        .post("/v1/generations", "alice", json!({ "prompt": "a red fox" }))
        .await;

    assert_eq!(response.status(), 500);
    assert_eq!(json_body(response).await["code"], "internal");

    let ledger = app.repo.ledger("alice").await.unwrap();
    assert_eq!(ledger.credits, 2);
    assert_eq!(ledger.active_generations, 0);
    assert_eq!(ledger.last_generation_at, None);
}

#[tokio::test]
async fn panicking_generator_still_releases_slot() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;
    app.generator.set_behavior(MockBehavior::Panic);

    let response = app
        .post("/v1/generations", "alice", json!({ "prompt": "a red fox" }))
        .await;

    assert_eq!(response.status(), 500);
    let ledger = app.repo.ledger("alice").await.unwrap();
    assert_eq!(ledger.credits, 2);
    assert_eq!(ledger.active_generations, 0);
}

#[tokio::test]
async fn cooldown_reports_retry_after() {
    let app = TestApp::spawn().await;
    let mut ledger = UserLedger::new_free(2, 2, Utc::now());
    ledger.last_generation_at = Some(Utc::now() - Duration::seconds(10));
    app.seed_ledger("alice", ledger).await;

    let response = app
        .post("/v1/generations", "alice", json!({ "prompt": "a red fox" }))
        .await;

    assert_eq!(response.status(), 429);
    assert_eq!(
        response.headers().get("retry-after").and_then(|v| v.to_str().ok()),
        Some("5")
    );
    let body = json_body(response).await;
    assert_eq!(body["code"], "resource_exhausted");
    assert_eq!(body["details"]["reason"], "cooldown");
    assert_eq!(body["details"]["retryAfterSeconds"], 5);
    assert_eq!(app.generator.calls(), 0);
}

#[tokio::test]
async fn concurrency_cap_applies_even_with_credits() {
    let app = TestApp::spawn().await;
    let mut ledger = UserLedger::new_free(50, 100, Utc::now());
    ledger.active_generations = 3;
    app.seed_ledger("alice", ledger).await;

    let response = app
        .post("/v1/generations", "alice", json!({ "prompt": "a red fox" }))
        .await;

    assert_eq!(response.status(), 429);
    assert_eq!(json_body(response).await["details"]["reason"], "concurrent_limit");
    assert_eq!(app.repo.ledger("alice").await.unwrap().active_generations, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_never_exceed_the_cap() {
    let repo = Arc::new(InMemoryLedgerRepository::new());
    repo.insert_ledger("alice", UserLedger::new_free(50, 100, Utc::now()))
        .await;
    let slots = SlotManager::new(
        repo.clone(),
        RateLimitPolicy {
            cooldown: Duration::seconds(15),
            max_concurrent: 3,
        },
    );

    let (a, b, c, d) = tokio::join!(
        slots.acquire_slot("alice", 1),
        slots.acquire_slot("alice", 1),
        slots.acquire_slot("alice", 1),
        slots.acquire_slot("alice", 1),
    );

    let mut handles = Vec::new();
    let mut rejected = 0;
    for result in [a, b, c, d] {
        match result {
            Ok(handle) => handles.push(handle),
            Err(CreditError::RateLimited {
                reason: RateLimitReason::ConcurrentLimit,
                ..
            }) => rejected += 1,
            Err(other) => panic!("unexpected acquire error: {:?}", other),
        }
    }
    assert_eq!(handles.len(), 3);
    assert_eq!(rejected, 1);
    assert_eq!(repo.ledger("alice").await.unwrap().active_generations, 3);

    for handle in &handles {
        slots.release_slot(handle, false).await.unwrap();
    }
    let ledger = repo.ledger("alice").await.unwrap();
    assert_eq!(ledger.active_generations, 0);
    assert_eq!(ledger.credits, 50);
}

#[tokio::test]
async fn insufficient_credits_blocks_generation() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 1).await;

    let response = app
        .post("/v1/generations", "alice", json!({ "prompt": "a red fox", "credits": 2 }))
        .await;

    assert_eq!(response.status(), 429);
    let body = json_body(response).await;
    assert_eq!(body["details"]["reason"], "insufficient_credits");
    assert_eq!(body["details"]["currentCredits"], 1);
}

#[tokio::test]
async fn generation_without_ledger_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .post("/v1/generations", "ghost", json!({ "prompt": "a red fox" }))
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn empty_prompt_is_invalid() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 2).await;

    let response = app
        .post("/v1/generations", "alice", json!({ "prompt": "" }))
        .await;

    assert_eq!(response.status(), 400);
    assert_eq!(json_body(response).await["code"], "invalid_argument");
}

#[tokio::test]
async fn onboarding_generation_is_free_and_single_use() {
    let app = TestApp::spawn().await;
    app.seed_free_ledger("alice", 0).await;

    let first = app
        .post("/v1/generations/onboarding", "alice", json!({ "prompt": "hello" }))
        .await;
    assert_eq!(first.status(), 200);
    assert_eq!(json_body(first).await["imageBase64"], "mock-image:hello");

    let second = app
        .post("/v1/generations/onboarding", "alice", json!({ "prompt": "again" }))
        .await;
    assert_eq!(second.status(), 412);
    let body = json_body(second).await;
    assert_eq!(body["code"], "failed_precondition");
    assert_eq!(body["details"]["reason"], "onboarding_generation_used");

    let ledger = app.repo.ledger("alice").await.unwrap();
    assert_eq!(ledger.credits, 0);
    assert!(ledger.used_free_onboarding_generation);
    assert_eq!(app.generator.calls(), 1);
}
