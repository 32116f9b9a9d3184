#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use credits_service::config::{
    AdminConfig, BillingConfig, CreditsConfig, GenerationConfig, IdentityConfig, JobsConfig,
    RateLimitConfig, StoreBackend, StoreConfig,
};
use credits_service::models::{PlanCatalog, ProductCatalog, UserLedger};
use credits_service::services::generator::{MockBehavior, MockImageGenerator};
use credits_service::services::{
    init_metrics, HttpBillingOracle, InMemoryLedgerRepository, StaticIdentityDirectory,
};
use credits_service::{Application, Collaborators};
use secrecy::Secret;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ADMIN_KEY: &str = "test-admin-key";
pub const ENTITLEMENT: &str = "Pro";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub repo: Arc<InMemoryLedgerRepository>,
    pub oracle: MockServer,
    pub generator: Arc<MockImageGenerator>,
    pub client: reqwest::Client,
}

pub fn test_config(oracle_url: &str) -> CreditsConfig {
    let products = ProductCatalog {
        topups: HashMap::from([
            ("credits_15".to_string(), 15),
            ("credits_5".to_string(), 5),
        ]),
        subscriptions: credits_service::config::parse_subscription_products(
            "pro_monthly:monthly_pro,pro_annual:annual_pro",
        )
        .expect("valid subscription products"),
    };

    CreditsConfig {
        common: service_core::config::Config {
            port: 0,
            log_level: "warn".to_string(),
            otlp_endpoint: None,
        },
        service_name: "credits-service-test".to_string(),
        store: StoreConfig {
            backend: StoreBackend::Memory,
            uri: Secret::new(String::new()),
            database: "unused".to_string(),
        },
        limits: RateLimitConfig::default(),
        plans: PlanCatalog::default(),
        subscription_bonus_credits: 50,
        products,
        billing: BillingConfig {
            api_url: oracle_url.to_string(),
            api_key: Secret::new("test-billing-key".to_string()),
            entitlement: ENTITLEMENT.to_string(),
            verify_attempts: 2,
        },
        identity: IdentityConfig {
            api_url: None,
            api_key: Secret::new(String::new()),
        },
        generation: GenerationConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            api_key: Secret::new(String::new()),
            timeout_seconds: 5,
        },
        jobs: JobsConfig {
            enabled: false,
            interval_hours: 24,
            max_retries: 0,
        },
        admin: AdminConfig {
            api_key: Secret::new(ADMIN_KEY.to_string()),
        },
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_identities(Vec::new()).await
    }

    pub async fn spawn_with_identities(identities: Vec<String>) -> Self {
        init_metrics();

        let oracle = MockServer::start().await;
        let config = test_config(&oracle.uri());

        let repo = Arc::new(InMemoryLedgerRepository::new());
        let generator = Arc::new(MockImageGenerator::new(MockBehavior::Succeed));
        let collaborators = Collaborators {
            repository: repo.clone(),
            oracle: Arc::new(
                HttpBillingOracle::new(&config.billing).expect("Failed to build oracle client"),
            ),
            identities: Arc::new(StaticIdentityDirectory::new(identities)),
            generator: generator.clone(),
        };

        let app = Application::build_with(config, collaborators)
            .await
            .expect("Failed to build test application");
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            repo,
            oracle,
            generator,
            client,
        }
    }

    pub async fn get(&self, path: &str, uid: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .header("X-User-ID", uid)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post(&self, path: &str, uid: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("X-User-ID", uid)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn put(&self, path: &str, uid: &str, body: Value) -> reqwest::Response {
        self.client
            .put(format!("{}{}", self.address, path))
            .header("X-User-ID", uid)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn admin_post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("X-Admin-Key", ADMIN_KEY)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn seed_ledger(&self, uid: &str, ledger: UserLedger) {
        self.repo.insert_ledger(uid, ledger).await;
    }

    pub async fn seed_free_ledger(&self, uid: &str, credits: i64) {
        self.seed_ledger(uid, UserLedger::new_free(credits, 2, Utc::now()))
            .await;
    }

    /// Serve `subscriber` for `uid` from the mock billing oracle.
    pub async fn mock_subscriber(&self, uid: &str, subscriber: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/subscribers/{}", uid)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "subscriber": subscriber })),
            )
            .mount(&self.oracle)
            .await;
    }

    pub async fn mock_oracle_error(&self, uid: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(format!("/subscribers/{}", uid)))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.oracle)
            .await;
    }
}

/// Subscriber body holding one completed top-up purchase.
pub fn topup_subscriber(product_id: &str, transaction_id: &str) -> Value {
    json!({
        "entitlements": {},
        "non_subscriptions": {
            product_id: [
                { "id": transaction_id, "purchase_date": Utc::now().to_rfc3339() }
            ]
        },
        "subscriptions": {}
    })
}

/// Subscriber body with the tracked entitlement.
pub fn entitled_subscriber(
    product_id: &str,
    purchase_date: DateTime<Utc>,
    expires_date: Option<DateTime<Utc>>,
) -> Value {
    json!({
        "entitlements": {
            ENTITLEMENT: {
                "expires_date": expires_date.map(|d| d.to_rfc3339()),
                "purchase_date": purchase_date.to_rfc3339(),
                "product_identifier": product_id
            }
        },
        "non_subscriptions": {},
        "subscriptions": {
            product_id: {
                "original_transaction_id": "orig-1",
                "expires_date": expires_date.map(|d| d.to_rfc3339())
            }
        }
    })
}

/// Subscriber body whose entitlement carries no purchase date.
pub fn undated_entitled_subscriber(product_id: &str, expires_date: DateTime<Utc>) -> Value {
    json!({
        "entitlements": {
            ENTITLEMENT: {
                "expires_date": expires_date.to_rfc3339(),
                "product_identifier": product_id
            }
        },
        "non_subscriptions": {},
        "subscriptions": {}
    })
}

pub fn days_from_now(days: i64) -> DateTime<Utc> {
    Utc::now() + Duration::days(days)
}

pub async fn json_body(response: reqwest::Response) -> Value {
    response.json().await.expect("Response body is not JSON")
}
