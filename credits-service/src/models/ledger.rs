use super::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-user credit ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLedger {
    pub plan: Plan,
    pub credits: i64,
    pub max_credits: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_monthly_grant: DateTime<Utc>,
    #[serde(default)]
    pub active_generations: i64,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_generation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_free_onboarding_generation: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl UserLedger {
    /// A fresh free-tier ledger seeded with one grant.
    pub fn new_free(credits: i64, max_credits: i64, now: DateTime<Utc>) -> Self {
        Self {
            plan: Plan::Free,
            credits,
            max_credits,
            last_monthly_grant: now,
            active_generations: 0,
            last_generation_at: None,
            used_free_onboarding_generation: false,
            created_at: now,
        }
    }
}

/// What the store holds for a user id.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerState {
    /// No document at all.
    Missing,
    /// A document written by the client (profile fields) or a partial
    /// ledger write, missing some ledger fields. Whatever `created_at` and
    /// balance it already holds are kept when it is completed.
    Incomplete {
        created_at: Option<DateTime<Utc>>,
        credits: Option<i64>,
    },
    Ready(UserLedger),
}

impl LedgerState {
    pub fn ready(&self) -> Option<&UserLedger> {
        match self {
            LedgerState::Ready(ledger) => Some(ledger),
            _ => None,
        }
    }
}
