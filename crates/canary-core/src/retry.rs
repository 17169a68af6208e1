//! Exponential backoff for client construction.
//!
//! The canary may start before the cluster is reachable. Building a client
//! is retried with a doubling delay until the attempt budget runs out.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::CanaryConfig;
use crate::error::CanaryError;

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Maximum delay between attempts.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Doubling backoff starting at `initial_backoff`, capped at [`MAX_BACKOFF`].
    #[must_use]
    pub fn exponential(max_attempts: usize, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Policy from the bootstrap backoff settings.
    #[must_use]
    pub fn from_config(config: &CanaryConfig) -> Self {
        Self::exponential(
            config.bootstrap_backoff_max_attempts,
            config.bootstrap_backoff_scale,
        )
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(10, Duration::from_millis(5000))
    }
}

/// Runs `op` until it succeeds or the policy is exhausted, calling
/// `on_error` with the 1-based attempt number after every failure.
///
/// # Errors
///
/// Returns `CanaryError::ClientCreation` carrying the last failure once all
/// attempts are spent.
pub async fn with_retry_and_handler<F, T, Fut, H>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_error: H,
) -> Result<T, CanaryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CanaryError>>,
    H: FnMut(usize, &CanaryError),
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                on_error(attempt, &e);
                if !policy.should_retry(attempt) {
                    return Err(CanaryError::ClientCreation(format!(
                        "giving up after {attempt} attempts: {e}"
                    )));
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, max_attempts = policy.max_attempts, ?delay, error = %e, "retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(40_000));
        assert_eq!(policy.delay_for_attempt(5), MAX_BACKOFF);
        assert_eq!(policy.delay_for_attempt(200), MAX_BACKOFF);
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::exponential(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1));
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let mut failures = Vec::new();

        let value = with_retry_and_handler(
            &policy,
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CanaryError::ClusterUnavailable("not yet".into()))
                } else {
                    Ok(7)
                }
            },
            |attempt, _| failures.push(attempt),
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(failures, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_gives_up() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let mut failures = 0;

        let err = with_retry_and_handler(
            &policy,
            || async { Err::<(), _>(CanaryError::ClusterUnavailable("down".into())) },
            |_, _| failures += 1,
        )
        .await
        .unwrap_err();

        assert_eq!(failures, 3);
        assert!(matches!(err, CanaryError::ClientCreation(_)));
    }
}
