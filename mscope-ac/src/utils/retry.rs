//! Bounded retry with exponential backoff
//!
//! Two flavours share one [`RetryPolicy`]:
//! - registry calls classify `sqlx` errors (see [`classify_sqlx`]); lock
//!   contention backs off, lost connectivity backs off and reconnects
//! - blocking artifact I/O ([`retry_blocking`]) retries only `StoreError::Io`
//!
//! Anything else fails on the first attempt.

use crate::error::{IntegrityError, Result, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for a single backoff sleep
const MAX_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Sleep before attempt `attempt + 1`; doubles each time, capped at 1s
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(base.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// How a failed registry call should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Lock contention: back off and try again on the same pool
    Backoff,
    /// Connectivity lost: back off, rebuild the pool, try again
    Reconnect,
    /// Not transient
    Fail,
}

/// Classify a `sqlx` error for the registry retry loop
pub fn classify_sqlx(err: &sqlx::Error) -> RetryAction {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            RetryAction::Reconnect
        }
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("database is locked") || message.contains("database is busy") {
                RetryAction::Backoff
            } else {
                RetryAction::Fail
            }
        }
        _ => RetryAction::Fail,
    }
}

/// Run a blocking store operation on the blocking pool, retrying I/O failures
///
/// `NotFound` and `InvalidName` are returned immediately; they will not
/// change by trying again.
pub async fn retry_blocking<F, T>(operation_name: &str, policy: RetryPolicy, operation: F) -> Result<T>
where
    F: Fn() -> std::result::Result<T, StoreError> + Send + Sync + 'static,
    T: Send + 'static,
{
    let operation = Arc::new(operation);
    let start_time = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let op = Arc::clone(&operation);

        match tokio::task::spawn_blocking(move || op()).await? {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        "Artifact operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err @ StoreError::Io { .. }) if attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis(),
                    error = %err,
                    "Artifact I/O failed, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                if matches!(err, StoreError::Io { .. }) {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        error = %err,
                        "Artifact operation failed: retries exhausted"
                    );
                }
                return Err(IntegrityError::Store(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_classify_pool_errors_reconnect() {
        assert_eq!(classify_sqlx(&sqlx::Error::PoolTimedOut), RetryAction::Reconnect);
        assert_eq!(classify_sqlx(&sqlx::Error::PoolClosed), RetryAction::Reconnect);
        assert_eq!(classify_sqlx(&sqlx::Error::RowNotFound), RetryAction::Fail);
    }

    #[tokio::test]
    async fn test_blocking_retry_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_blocking("flaky", fast_policy(3), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Io {
                    name: "x".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk hiccup"),
                })
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blocking_retry_exhausts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = retry_blocking("broken", fast_policy(3), move || -> std::result::Result<(), StoreError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Io {
                name: "x".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
            })
        })
        .await
        .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = retry_blocking("missing", fast_policy(5), move || -> std::result::Result<(), StoreError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound("x".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, IntegrityError::Store(StoreError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
