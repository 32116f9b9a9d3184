//! Image generation backends.
//!
//! The ledger treats generation as an opaque call made while a slot is held.

use crate::config::GenerationConfig;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Generator API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Generation timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_image_base64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub mime_type: String,
    pub image_base64: String,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GeneratorError>;
}

/// Generator calling a remote image API over HTTP.
pub struct HttpImageGenerator {
    client: Client,
    api_url: String,
    api_key: Secret<String>,
}

impl HttpImageGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GeneratorError> {
        let url = format!("{}/generate", self.api_url);

        tracing::debug!(prompt_len = request.prompt.len(), "Sending generation request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| GeneratorError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, "Generation API returned an error");
            return Err(GeneratorError::Api(format!("{}: {}", status, body)));
        }

        response
            .json::<GeneratedImage>()
            .await
            .map_err(|e| GeneratorError::Api(format!("invalid response: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Succeed,
    Fail,
    Panic,
    /// Sleep this long before succeeding.
    Delay(Duration),
}

/// In-process generator for tests and local runs.
pub struct MockImageGenerator {
    behavior: std::sync::Mutex<MockBehavior>,
    calls: AtomicUsize,
}

impl MockImageGenerator {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: std::sync::Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        if let Ok(mut current) = self.behavior.lock() {
            *current = behavior;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior
            .lock()
            .map(|b| *b)
            .unwrap_or(MockBehavior::Fail)
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.behavior() {
            MockBehavior::Succeed => {}
            MockBehavior::Fail => {
                return Err(GeneratorError::Api("mock generator failure".to_string()))
            }
            MockBehavior::Panic => panic!("mock generator panicked"),
            MockBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }

        Ok(GeneratedImage {
            mime_type: "image/png".to_string(),
            image_base64: format!("mock-image:{}", request.prompt),
        })
    }
}
