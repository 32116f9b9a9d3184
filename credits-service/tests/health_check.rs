mod common;

use common::{json_body, TestApp};

#[tokio::test]
async fn health_check_pings_the_store() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "credits-service-test");
}

#[tokio::test]
async fn readiness_check_works() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/ready", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let app = TestApp::spawn().await;
    app.post("/v1/credits/initialize", "metered", serde_json::json!({}))
        .await;

    let response = app
        .client
        .get(format!("{}/metrics", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("credits_granted_total"));
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/ready", app.address))
        .header("x-request-id", "req-123")
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
}
