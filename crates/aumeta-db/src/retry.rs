//! Bounded retry of database work that fails for transient reasons.

use std::future::Future;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio::time::sleep;
use tracing::warn;

use aumeta_core::defaults;
use aumeta_core::{Error, Result};

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::DB_MAX_RETRY_COUNT,
            delay: Duration::from_millis(defaults::DB_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.max_retries)
    }
}

/// Run `op`, retrying it while it fails with a transient error.
///
/// Non-transient errors are returned on the first occurrence.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, op_name: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    op.retry(policy.backoff())
        .sleep(sleep)
        .when(Error::is_transient)
        .notify(|err: &Error, delay: Duration| {
            warn!(
                subsystem = "db",
                component = "retry",
                op = op_name,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient database failure, retrying"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast(retries: usize) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result = with_retry(fast(5), "test", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Database(sqlx::Error::PoolTimedOut))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<()> = with_retry(fast(3), "test", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<()> = with_retry(fast(5), "test", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Database(sqlx::Error::RowNotFound))
        })
        .await;

        assert!(matches!(result, Err(Error::Database(sqlx::Error::RowNotFound))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
