//! Retry engine with bounded exponential backoff.
//!
//! An operation is attempted up to `attempts` times. Between attempts the
//! engine sleeps `min(base_delay * 2^i, max_delay)`, and the sleep is raced
//! against the cancellation token so callers never wait out a backoff after
//! they have given up.

use crate::error::{looks_transient, DbError, DbResult, ErrorCode};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FALLBACK_ATTEMPTS: u32 = 3;
const FALLBACK_BASE_DELAY: Duration = Duration::from_millis(100);
const FALLBACK_MAX_DELAY: Duration = Duration::from_secs(5);

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: FALLBACK_ATTEMPTS,
            base_delay: FALLBACK_BASE_DELAY,
            max_delay: FALLBACK_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Replace zero values with the fallbacks.
    pub fn normalized(self) -> Self {
        Self {
            attempts: if self.attempts == 0 {
                FALLBACK_ATTEMPTS
            } else {
                self.attempts
            },
            base_delay: if self.base_delay.is_zero() {
                FALLBACK_BASE_DELAY
            } else {
                self.base_delay
            },
            max_delay: if self.max_delay.is_zero() {
                FALLBACK_MAX_DELAY
            } else {
                self.max_delay
            },
        }
    }

    /// Backoff to wait after the zero-based attempt `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Whether a failure is worth another attempt.
///
/// Exhausted retries and cancellations are final. Everything else is retried
/// when its code is retriable or its cause chain carries a transient signal.
pub fn should_retry(err: &DbError) -> bool {
    if err.is(ErrorCode::RetryExhausted) || err.is(ErrorCode::Cancelled) {
        return false;
    }
    if err.is_retriable() {
        return true;
    }
    err.cause().is_some_and(|cause| looks_transient(cause))
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts or
/// `cancel` fires.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let policy = policy.normalized();
    let mut last_err = None;

    for attempt in 0..policy.attempts {
        if cancel.is_cancelled() {
            return Err(DbError::cancelled(operation));
        }

        let err = match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(operation, code = %err.code(), error = %err, "non-retriable error");
            return Err(err);
        }

        let is_last = attempt + 1 == policy.attempts;
        if is_last {
            error!(
                operation,
                total_attempts = policy.attempts,
                error = %err,
                "operation failed after all retries"
            );
            last_err = Some(err);
            break;
        }

        let delay = policy.delay_for(attempt);
        warn!(
            operation,
            attempt = attempt + 1,
            total_attempts = policy.attempts,
            retry_delay_ms = delay.as_millis() as u64,
            error = %err,
            "operation failed, retrying"
        );
        last_err = Some(err);

        tokio::select! {
            _ = cancel.cancelled() => return Err(DbError::cancelled(operation)),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let last = last_err
        .unwrap_or_else(|| DbError::new(ErrorCode::Internal, "retry loop made no attempts"));
    Err(DbError::retry_exhausted(operation, policy.attempts, last))
}

/// Await `fut` unless `cancel` fires first.
pub async fn cancellable<T, Fut>(
    cancel: &CancellationToken,
    operation: &str,
    fut: Fut,
) -> DbResult<T>
where
    Fut: Future<Output = DbResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(DbError::cancelled(operation));
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(DbError::cancelled(operation)),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = fast_policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(100));
        assert_eq!(policy.delay_for(40), Duration::from_millis(100));
    }

    #[test]
    fn test_normalized_fills_zeroes() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).normalized();
        assert_eq!(policy, RetryPolicy::default());

        let policy = fast_policy().normalized();
        assert_eq!(policy, fast_policy());
    }

    #[test]
    fn test_should_retry() {
        assert!(should_retry(&DbError::connection("down")));
        assert!(!should_retry(&DbError::validation("bad input")));
        assert!(!should_retry(&DbError::cancelled("op")));
        assert!(!should_retry(&DbError::retry_exhausted(
            "op",
            3,
            DbError::connection("down")
        )));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = DbError::new(ErrorCode::QueryFailed, "query failed").with_source(io);
        assert!(should_retry(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let counter = calls.clone();
        let result = with_retry(&cancel, &fast_policy(), "flaky", || {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(DbError::new(ErrorCode::ConnectionTimeout, "timed out")),
                    _ => Ok("ok"),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let err = with_retry(&cancel, &fast_policy(), "validate", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(DbError::validation("bad input")) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let counter = calls.clone();
        let err = with_retry(&cancel, &fast_policy(), "ping", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(DbError::connection("refused")) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RetryExhausted);
        assert_eq!(err.operation(), Some("ping"));
        assert_eq!(err.context().get("attempts"), Some(&serde_json::json!(3)));
        let last = err.cause().and_then(|c| c.downcast_ref::<DbError>()).unwrap();
        assert_eq!(last.code(), ErrorCode::ConnectionFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No sleep after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let counter = calls.clone();
        let err = with_retry(&cancel, &fast_policy(), "ping", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, DbError>(()) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(60));
        let start = Instant::now();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = with_retry(&cancel, &policy, "ping", || async {
            Err::<(), _>(DbError::connection("refused"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellable() {
        let cancel = CancellationToken::new();
        let value = cancellable(&cancel, "op", async { Ok::<_, DbError>(7) }).await;
        assert_eq!(value.unwrap(), 7);

        cancel.cancel();
        let err = cancellable(&cancel, "op", std::future::pending::<DbResult<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }
}
