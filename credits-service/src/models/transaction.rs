use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Idempotency record for a credited top-up, keyed by the billing
/// provider's transaction id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedTransaction {
    #[serde(rename = "_id")]
    pub transaction_id: String,
    pub uid: String,
    pub product_id: String,
    pub credits_granted: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub processed_at: DateTime<Utc>,
}
