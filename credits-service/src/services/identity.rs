//! Identity provider directory, used to backfill ledgers for accounts that
//! existed before the ledger did.

use crate::config::IdentityConfig;
use crate::services::error::CreditError;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct IdentityPage {
    pub uids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn list_identities(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<IdentityPage, CreditError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListUsersResponse {
    #[serde(default)]
    users: Vec<IdentityRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityRecord {
    uid: String,
}

/// Pages `GET {api_url}/users` on the identity provider's admin API.
pub struct HttpIdentityDirectory {
    client: Client,
    api_url: String,
    api_key: Secret<String>,
}

impl HttpIdentityDirectory {
    pub fn new(api_url: &str, config: &IdentityConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl IdentityDirectory for HttpIdentityDirectory {
    async fn list_identities(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<IdentityPage, CreditError> {
        let mut url = format!("{}/users?page_size={}", self.api_url, page_size);
        if let Some(token) = page_token {
            url.push_str(&format!("&page_token={}", urlencoding::encode(token)));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| CreditError::Internal(anyhow::anyhow!("identity directory: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CreditError::Internal(anyhow::anyhow!(
                "identity directory returned {}",
                status
            )));
        }

        let body: ListUsersResponse = response
            .json()
            .await
            .map_err(|e| CreditError::Internal(anyhow::anyhow!("identity directory: {}", e)))?;

        Ok(IdentityPage {
            uids: body.users.into_iter().map(|u| u.uid).collect(),
            next_page_token: body.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

/// Fixed list of identities. Page tokens are offsets.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityDirectory {
    uids: Vec<String>,
}

impl StaticIdentityDirectory {
    pub fn new(uids: Vec<String>) -> Self {
        Self { uids }
    }
}

#[async_trait]
impl IdentityDirectory for StaticIdentityDirectory {
    async fn list_identities(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<IdentityPage, CreditError> {
        let start = match page_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                CreditError::InvalidArgument(format!("bad page token '{}'", token))
            })?,
            None => 0,
        };
        let end = (start + page_size.max(1)).min(self.uids.len());
        let uids = self.uids.get(start..end).unwrap_or_default().to_vec();

        Ok(IdentityPage {
            uids,
            next_page_token: (end < self.uids.len()).then(|| end.to_string()),
        })
    }
}
