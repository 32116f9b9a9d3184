//! Grant engine: how much a plan yields per cycle and how that is capped.

use crate::models::PlanConfig;
use chrono::{DateTime, Duration, Utc};

/// Length of a recurring grant cycle. Fixed duration rather than calendar
/// months.
pub const GRANT_CYCLE_DAYS: i64 = 30;

pub fn grant_cycle() -> Duration {
    Duration::days(GRANT_CYCLE_DAYS)
}

/// True once a full cycle has passed since `last_grant`.
pub fn has_cycle_elapsed(last_grant: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - last_grant >= grant_cycle()
}

/// Balance after one recurring grant.
///
/// The grant is capped at `max_credits`; a balance already at or above the
/// cap (purchased top-ups) is returned unchanged.
pub fn apply_grant(current_credits: i64, cfg: &PlanConfig) -> i64 {
    if current_credits < cfg.max_credits {
        (current_credits + cfg.monthly_credits).min(cfg.max_credits)
    } else {
        current_credits
    }
}

/// Balance after a fixed bonus capped at `max_credits`. Never lowers the
/// balance.
pub fn apply_capped_bonus(current_credits: i64, bonus: i64, max_credits: i64) -> i64 {
    apply_grant(
        current_credits,
        &PlanConfig {
            monthly_credits: bonus,
            max_credits,
        },
    )
}
