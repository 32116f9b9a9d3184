//! Background scheduler for the daily ledger jobs.

use crate::config::JobsConfig;
use crate::services::error::CreditError;
use crate::services::metrics::record_job_run;
use crate::services::monthly_grants::{GrantReport, MonthlyGrantJob};
use crate::services::reconciler::{ReconcileReport, SubscriptionReconciler};
use crate::services::retry::{retry_bounded, RetryPolicy};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const MONTHLY_GRANTS_JOB: &str = "monthly_grants";
pub const RECONCILE_JOB: &str = "reconcile_subscriptions";

#[derive(Clone)]
pub struct JobScheduler {
    grants: MonthlyGrantJob,
    reconciler: SubscriptionReconciler,
    interval: Duration,
    retry: RetryPolicy,
}

impl JobScheduler {
    pub fn new(
        grants: MonthlyGrantJob,
        reconciler: SubscriptionReconciler,
        config: &JobsConfig,
    ) -> Self {
        Self {
            grants,
            reconciler,
            interval: Duration::from_secs(config.interval_hours.max(1) * 3600),
            // First attempt plus `max_retries` retries.
            retry: RetryPolicy::new(config.max_retries + 1, Duration::from_secs(30)),
        }
    }

    pub async fn run_monthly_grants(&self) -> Result<GrantReport, CreditError> {
        run_job(MONTHLY_GRANTS_JOB, self.retry, || self.grants.run()).await
    }

    pub async fn run_reconciliation(&self) -> Result<ReconcileReport, CreditError> {
        run_job(RECONCILE_JOB, self.retry, || self.reconciler.run()).await
    }

    /// One scheduled tick. Each job is independent; a failure of one does
    /// not skip the other.
    pub async fn run_once(&self) {
        if let Err(e) = self.run_monthly_grants().await {
            tracing::error!(job = MONTHLY_GRANTS_JOB, error = %e, "Job gave up after retries");
        }
        if let Err(e) = self.run_reconciliation().await {
            tracing::error!(job = RECONCILE_JOB, error = %e, "Job gave up after retries");
        }
    }

    /// Run both jobs every interval, starting one interval from now.
    pub fn spawn(self) -> JoinHandle<()> {
        tracing::info!(interval_secs = self.interval.as_secs(), "Job scheduler started");
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

/// Run a whole job, retrying it with backoff when it fails as a whole.
async fn run_job<T, F, Fut>(job: &'static str, policy: RetryPolicy, mut run: F) -> Result<T, CreditError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CreditError>>,
{
    let result = retry_bounded(policy, || {
        let attempt = run();
        async move {
            attempt.await.map_err(|e| {
                tracing::warn!(job, error = %e, "Job run failed");
                backoff::Error::transient(e)
            })
        }
    })
    .await;

    record_job_run(job, if result.is_ok() { "success" } else { "failure" });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn job_failing_as_a_whole_is_retried_then_reported() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<(), CreditError> = run_job("test", policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CreditError::Internal(anyhow::anyhow!("store down"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn job_recovers_on_a_later_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result = run_job("test", policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(CreditError::Internal(anyhow::anyhow!("blip")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }
}
