use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Exponential backoff with a hard cap on attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            max_interval: initial_interval * 8,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or has been tried
/// `max_attempts` times. The error of the last attempt is returned.
pub async fn retry_bounded<T, E, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, backoff::Error<E>>>,
{
    let attempts = AtomicU32::new(0);
    let backoff = ExponentialBackoff {
        initial_interval: policy.initial_interval,
        current_interval: policy.initial_interval,
        max_interval: policy.max_interval,
        max_elapsed_time: None,
        ..Default::default()
    };

    retry(backoff, || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let fut = operation();
        async move {
            match fut.await {
                Err(backoff::Error::Transient { err, .. }) if attempt >= policy.max_attempts => {
                    Err(backoff::Error::permanent(err))
                }
                other => other,
            }
        }
    })
    .await
}
