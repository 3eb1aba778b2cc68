use std::future::Future;
use std::time::Duration;

use crate::repository::StoreError;

/// RetryPolicy
///
/// Bounded retry for idempotent storage reads. Only `StoreError::Unavailable` is
/// retried; every other error is returned on the first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << retry.min(16))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the retry
/// budget is spent. Callers must only pass read operations.
pub async fn idempotent<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && retry < policy.max_retries => {
                let delay = policy.backoff(retry);
                tracing::warn!(
                    error = %err,
                    retry = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    "storage unavailable, retrying read"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            result => return result,
        }
    }
}
