use super::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

/// Paid plan tracked against the billing provider. One per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    #[serde(rename = "_id")]
    pub uid: String,
    pub plan: Plan,
    pub product_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub purchase_date: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_credit_grant: Option<DateTime<Utc>>,
    pub status: SubscriptionStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}
