//! Generation slots: cooldown, concurrency cap and credit gate around a
//! metered operation.

use crate::config::RateLimitConfig;
use crate::models::{LedgerState, UserLedger};
use crate::services::error::{CreditError, RateLimitReason};
use crate::services::metrics::{record_credits_consumed, record_slot_rejection};
use crate::services::store::{run_transaction, LedgerRepository, Snapshot, TxnScope, Write};
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub cooldown: Duration,
    pub max_concurrent: i64,
}

impl From<RateLimitConfig> for RateLimitPolicy {
    fn from(cfg: RateLimitConfig) -> Self {
        Self {
            cooldown: Duration::seconds(cfg.cooldown_seconds as i64),
            max_concurrent: cfg.max_concurrent_generations,
        }
    }
}

/// An acquired slot. Must be released exactly once.
#[derive(Debug, Clone)]
pub struct SlotHandle {
    pub uid: String,
    pub credits_to_consume: i64,
    pub acquired_at: DateTime<Utc>,
}

/// Result of a metered operation with the balance left after it.
#[derive(Debug)]
pub struct Metered<T> {
    pub value: T,
    pub remaining_credits: Option<i64>,
}

/// Gate checks, in order: cooldown, concurrency, credits.
pub fn check_slot(
    ledger: &UserLedger,
    credits_required: i64,
    policy: &RateLimitPolicy,
    now: DateTime<Utc>,
) -> Result<(), CreditError> {
    if let Some(last) = ledger.last_generation_at {
        let elapsed = now - last;
        if elapsed < policy.cooldown {
            let remaining_ms = (policy.cooldown - elapsed).num_milliseconds();
            let retry_after = ((remaining_ms + 999) / 1000).max(1) as u64;
            return Err(CreditError::RateLimited {
                reason: RateLimitReason::Cooldown,
                retry_after_seconds: Some(retry_after),
                current_credits: None,
            });
        }
    }

    if ledger.active_generations >= policy.max_concurrent {
        return Err(CreditError::RateLimited {
            reason: RateLimitReason::ConcurrentLimit,
            retry_after_seconds: None,
            current_credits: None,
        });
    }

    if ledger.credits < credits_required {
        return Err(CreditError::RateLimited {
            reason: RateLimitReason::InsufficientCredits,
            retry_after_seconds: None,
            current_credits: Some(ledger.credits),
        });
    }

    Ok(())
}

/// Ledger after releasing one slot.
pub fn release_ledger(ledger: &mut UserLedger, credits: i64, success: bool, now: DateTime<Utc>) {
    ledger.active_generations = (ledger.active_generations - 1).max(0);
    if success {
        ledger.credits = (ledger.credits - credits).max(0);
        ledger.last_generation_at = Some(now);
    }
}

#[derive(Clone)]
pub struct SlotManager {
    repository: Arc<dyn LedgerRepository>,
    policy: RateLimitPolicy,
}

impl SlotManager {
    pub fn new(repository: Arc<dyn LedgerRepository>, policy: RateLimitPolicy) -> Self {
        Self { repository, policy }
    }

    #[instrument(skip(self))]
    pub async fn acquire_slot(
        &self,
        uid: &str,
        credits_required: i64,
    ) -> Result<SlotHandle, CreditError> {
        if credits_required < 1 {
            return Err(CreditError::InvalidArgument(
                "credits required must be at least 1".to_string(),
            ));
        }

        let now = Utc::now();
        let policy = self.policy;
        let result = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(uid),
            |snapshot: &Snapshot| {
                let mut ledger = snapshot.ledger.ready().cloned().ok_or(CreditError::NotFound)?;
                check_slot(&ledger, credits_required, &policy, now)?;
                ledger.active_generations += 1;
                Ok((vec![Write::PutLedger(ledger)], ()))
            },
        )
        .await;

        if let Err(CreditError::RateLimited { reason, .. }) = &result {
            record_slot_rejection(reason.as_str());
            tracing::info!(uid = %uid, reason = reason.as_str(), "Generation slot rejected");
        }
        result?;

        Ok(SlotHandle {
            uid: uid.to_string(),
            credits_to_consume: credits_required,
            acquired_at: now,
        })
    }

    /// Release a slot, charging its credits when `success`. Returns the
    /// remaining balance, or `None` if the ledger no longer exists.
    #[instrument(skip(self), fields(uid = %handle.uid))]
    pub async fn release_slot(
        &self,
        handle: &SlotHandle,
        success: bool,
    ) -> Result<Option<i64>, CreditError> {
        let now = Utc::now();
        let credits = handle.credits_to_consume;
        let remaining = run_transaction(
            self.repository.as_ref(),
            &TxnScope::user(&handle.uid),
            |snapshot: &Snapshot| match &snapshot.ledger {
                LedgerState::Ready(current) => {
                    let mut ledger = current.clone();
                    release_ledger(&mut ledger, credits, success, now);
                    let remaining = ledger.credits;
                    Ok((vec![Write::PutLedger(ledger)], Some(remaining)))
                }
                _ => Ok((Vec::new(), None)),
            },
        )
        .await?;

        match remaining {
            None => {
                tracing::warn!(uid = %handle.uid, "Ledger missing on slot release");
            }
            Some(remaining) if success => {
                record_credits_consumed("generation", credits);
                tracing::info!(uid = %handle.uid, credits, remaining, "Generation charged");
            }
            Some(_) => {}
        }

        Ok(remaining)
    }

    /// Acquire a slot, run `operation`, release the slot whatever happens.
    ///
    /// Credits are charged only when `operation` returns `Ok`. An error or a
    /// panic inside `operation` releases without charging and is then passed
    /// on unchanged.
    pub async fn execute_with_rate_limiting<T, F, Fut>(
        &self,
        uid: &str,
        credits_required: i64,
        operation: F,
    ) -> Result<Metered<T>, CreditError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CreditError>>,
    {
        let handle = self.acquire_slot(uid, credits_required).await?;

        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                let remaining_credits = match self.release_slot(&handle, true).await {
                    Ok(remaining) => remaining,
                    Err(e) => {
                        tracing::error!(uid = %uid, error = %e, "Failed to release slot after success");
                        None
                    }
                };
                Ok(Metered {
                    value,
                    remaining_credits,
                })
            }
            Ok(Err(err)) => {
                if let Err(e) = self.release_slot(&handle, false).await {
                    tracing::error!(uid = %uid, error = %e, "Failed to release slot after failure");
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(e) = self.release_slot(&handle, false).await {
                    tracing::error!(uid = %uid, error = %e, "Failed to release slot after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::InMemoryLedgerRepository;

    fn policy() -> RateLimitPolicy {
        RateLimitConfig::default().into()
    }

    fn ledger(credits: i64) -> UserLedger {
        UserLedger::new_free(credits, 2, Utc::now())
    }

    #[test]
    fn cooldown_reports_whole_seconds_remaining() {
        let now = Utc::now();
        let mut l = ledger(2);
        l.last_generation_at = Some(now - Duration::seconds(10));
        match check_slot(&l, 1, &policy(), now) {
            Err(CreditError::RateLimited {
                reason: RateLimitReason::Cooldown,
                retry_after_seconds,
                ..
            }) => assert_eq!(retry_after_seconds, Some(5)),
            other => panic!("expected cooldown, got {:?}", other),
        }
    }

    #[test]
    fn cooldown_rounds_partial_seconds_up() {
        let now = Utc::now();
        let mut l = ledger(2);
        l.last_generation_at = Some(now - Duration::milliseconds(10_500));
        match check_slot(&l, 1, &policy(), now) {
            Err(CreditError::RateLimited {
                retry_after_seconds,
                ..
            }) => assert_eq!(retry_after_seconds, Some(5)),
            other => panic!("expected cooldown, got {:?}", other),
        }
    }

    #[test]
    fn concurrency_cap_applies_regardless_of_credits() {
        let mut l = ledger(100);
        l.active_generations = 3;
        match check_slot(&l, 1, &policy(), Utc::now()) {
            Err(CreditError::RateLimited { reason, .. }) => {
                assert_eq!(reason, RateLimitReason::ConcurrentLimit)
            }
            other => panic!("expected concurrent_limit, got {:?}", other),
        }
    }

    #[test]
    fn cooldown_is_checked_before_concurrency_and_credits() {
        let now = Utc::now();
        let mut l = ledger(0);
        l.active_generations = 3;
        l.last_generation_at = Some(now - Duration::seconds(1));
        match check_slot(&l, 1, &policy(), now) {
            Err(CreditError::RateLimited { reason, .. }) => {
                assert_eq!(reason, RateLimitReason::Cooldown)
            }
            other => panic!("expected cooldown, got {:?}", other),
        }
    }

    #[test]
    fn insufficient_credits_reports_balance() {
        match check_slot(&ledger(0), 1, &policy(), Utc::now()) {
            Err(CreditError::RateLimited {
                reason: RateLimitReason::InsufficientCredits,
                current_credits,
                ..
            }) => assert_eq!(current_credits, Some(0)),
            other => panic!("expected insufficient_credits, got {:?}", other),
        }
    }

    #[test]
    fn release_floors_counters_at_zero() {
        let now = Utc::now();
        let mut l = ledger(0);
        release_ledger(&mut l, 3, true, now);
        assert_eq!(l.active_generations, 0);
        assert_eq!(l.credits, 0);
        assert_eq!(l.last_generation_at, Some(now));
    }

    #[tokio::test]
    async fn failed_operation_releases_without_charging() {
        let repo = Arc::new(InMemoryLedgerRepository::new());
        repo.insert_ledger("u1", ledger(2)).await;
        let slots = SlotManager::new(repo.clone(), policy());

        let result: Result<Metered<()>, CreditError> = slots
            .execute_with_rate_limiting("u1", 1, || async {
                Err(CreditError::Generation("model overloaded".into()))
            })
            .await;

        assert!(matches!(result, Err(CreditError::Generation(_))));
        let l = repo.ledger("u1").await.unwrap();
        assert_eq!(l.active_generations, 0);
        assert_eq!(l.credits, 2);
        assert_eq!(l.last_generation_at, None);
    }

    #[tokio::test]
    async fn successful_operation_charges_and_starts_cooldown() {
        let repo = Arc::new(InMemoryLedgerRepository::new());
        repo.insert_ledger("u1", ledger(2)).await;
        let slots = SlotManager::new(repo.clone(), policy());

        let metered = slots
            .execute_with_rate_limiting("u1", 1, || async { Ok("image") })
            .await
            .unwrap();

        assert_eq!(metered.value, "image");
        assert_eq!(metered.remaining_credits, Some(1));
        let l = repo.ledger("u1").await.unwrap();
        assert_eq!(l.active_generations, 0);
        assert_eq!(l.credits, 1);
        assert!(l.last_generation_at.is_some());
    }

    #[tokio::test]
    async fn panicking_operation_still_releases() {
        let repo = Arc::new(InMemoryLedgerRepository::new());
        repo.insert_ledger("u1", ledger(2)).await;
        let slots = SlotManager::new(repo.clone(), policy());

        let task_slots = slots.clone();
        let joined = tokio::spawn(async move {
            task_slots
                .execute_with_rate_limiting("u1", 1, || async {
                    if true {
                        panic!("generator exploded");
                    }
                    Ok(())
                })
                .await
        })
        .await;

        assert!(joined.is_err());
        let l = repo.ledger("u1").await.unwrap();
        assert_eq!(l.active_generations, 0);
        assert_eq!(l.credits, 2);
    }

    #[tokio::test]
    async fn release_tolerates_missing_ledger() {
        let repo = Arc::new(InMemoryLedgerRepository::new());
        let slots = SlotManager::new(repo, policy());
        let handle = SlotHandle {
            uid: "gone".into(),
            credits_to_consume: 1,
            acquired_at: Utc::now(),
        };
        assert_eq!(slots.release_slot(&handle, true).await.unwrap(), None);
    }
}
