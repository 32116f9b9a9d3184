//! Billing oracle client.
//!
//! The billing provider is the source of truth for purchases and
//! entitlements. It is eventually consistent: a purchase may take a moment
//! to show up after the store reports it to the client.

use crate::config::BillingConfig;
use crate::services::error::CreditError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberResponse {
    pub subscriber: SubscriberInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriberInfo {
    #[serde(default)]
    pub entitlements: HashMap<String, Entitlement>,
    #[serde(default)]
    pub non_subscriptions: HashMap<String, Vec<NonSubscriptionPurchase>>,
    #[serde(default)]
    pub subscriptions: HashMap<String, SubscriptionPurchase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entitlement {
    #[serde(default)]
    pub expires_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub product_identifier: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NonSubscriptionPurchase {
    pub id: String,
    #[serde(default)]
    pub store_transaction_id: Option<String>,
    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPurchase {
    #[serde(default)]
    pub original_transaction_id: Option<String>,
    #[serde(default)]
    pub store_transaction_id: Option<String>,
    #[serde(default)]
    pub expires_date: Option<DateTime<Utc>>,
}

impl SubscriberInfo {
    pub fn entitlement(&self, name: &str) -> Option<&Entitlement> {
        self.entitlements.get(name)
    }

    /// Whether `transaction_id` is a completed one-time purchase of
    /// `product_id`.
    pub fn has_non_subscription(&self, product_id: &str, transaction_id: &str) -> bool {
        self.non_subscriptions
            .get(product_id)
            .map(|purchases| {
                purchases.iter().any(|p| {
                    p.id == transaction_id
                        || p.store_transaction_id.as_deref() == Some(transaction_id)
                })
            })
            .unwrap_or(false)
    }

    pub fn original_transaction_id(&self, product_id: &str) -> Option<String> {
        self.subscriptions
            .get(product_id)
            .and_then(|s| {
                s.original_transaction_id
                    .clone()
                    .or_else(|| s.store_transaction_id.clone())
            })
    }
}

#[async_trait]
pub trait BillingOracle: Send + Sync {
    /// Current subscriber record, or `None` if the provider does not know
    /// the user (yet).
    async fn subscriber(&self, uid: &str) -> Result<Option<SubscriberInfo>, CreditError>;
}

pub struct HttpBillingOracle {
    client: Client,
    api_url: String,
    api_key: Secret<String>,
}

impl HttpBillingOracle {
    pub fn new(config: &BillingConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl BillingOracle for HttpBillingOracle {
    async fn subscriber(&self, uid: &str) -> Result<Option<SubscriberInfo>, CreditError> {
        let url = format!("{}/subscribers/{}", self.api_url, urlencoding::encode(uid));

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(uid = %uid, error = %e, "Billing oracle unreachable");
                CreditError::Oracle(format!("request failed: {}", e))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(uid = %uid, "Billing oracle has no subscriber");
            return Ok(None);
        }
        if !status.is_success() {
            tracing::error!(uid = %uid, status = %status, "Billing oracle returned an error");
            return Err(CreditError::Oracle(format!("unexpected status {}", status)));
        }

        let body: SubscriberResponse = response
            .json()
            .await
            .map_err(|e| CreditError::Oracle(format!("invalid subscriber response: {}", e)))?;

        Ok(Some(body.subscriber))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "request_date": "2026-01-01T00:00:00Z",
        "subscriber": {
            "original_app_user_id": "u1",
            "entitlements": {
                "Pro": {
                    "expires_date": "2026-02-01T00:00:00Z",
                    "purchase_date": "2026-01-01T00:00:00Z",
                    "product_identifier": "pro_monthly"
                }
            },
            "non_subscriptions": {
                "credits_15": [
                    { "id": "rc_1", "store_transaction_id": "store_1", "purchase_date": "2026-01-01T00:00:00Z" }
                ]
            },
            "subscriptions": {
                "pro_monthly": { "store_transaction_id": "orig_1", "expires_date": "2026-02-01T00:00:00Z" }
            }
        }
    }"#;

    #[test]
    fn parses_subscriber_response() {
        let parsed: SubscriberResponse = serde_json::from_str(BODY).unwrap();
        let info = parsed.subscriber;

        let pro = info.entitlement("Pro").unwrap();
        assert_eq!(pro.product_identifier.as_deref(), Some("pro_monthly"));
        assert!(pro.expires_date.is_some());

        assert!(info.has_non_subscription("credits_15", "rc_1"));
        assert!(info.has_non_subscription("credits_15", "store_1"));
        assert!(!info.has_non_subscription("credits_15", "other"));
        assert!(!info.has_non_subscription("credits_5", "rc_1"));

        assert_eq!(info.original_transaction_id("pro_monthly").as_deref(), Some("orig_1"));
    }

    #[test]
    fn lifetime_entitlement_has_no_expiry() {
        let info: SubscriberInfo = serde_json::from_str(
            r#"{ "entitlements": { "Pro": { "expires_date": null, "purchase_date": null } } }"#,
        )
        .unwrap();
        assert!(info.entitlement("Pro").unwrap().expires_date.is_none());
        assert!(info.non_subscriptions.is_empty());
    }
}
