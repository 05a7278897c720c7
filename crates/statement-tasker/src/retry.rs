//! Retry wrapper for throttled calls.
//!
//! Only throttling is retried by [`retry_throttled`]. Every other error
//! surfaces on the first occurrence. [`retry_if`] takes the retry condition
//! from the caller.

use statement_api::GatewayError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::TaskerError;

/// Errors that can report a throttling condition.
pub trait Retryable {
    fn is_throttled(&self) -> bool;
}

impl Retryable for TaskerError {
    fn is_throttled(&self) -> bool {
        TaskerError::is_throttled(self)
    }
}

impl Retryable for GatewayError {
    fn is_throttled(&self) -> bool {
        GatewayError::is_throttled(self)
    }
}

/// Upper bound on a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Exponential backoff policy for throttled calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub interval: Duration,

    /// Multiplier applied to the delay after each retry.
    pub backoff_rate: f64,

    /// Retries after the first call.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            backoff_rate: 1.5,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), capped at fifteen minutes.
    pub fn delay(&self, retry: u32) -> Duration {
        let secs = self.interval.as_secs_f64() * self.backoff_rate.powi(retry as i32);
        Duration::try_from_secs_f64(secs).map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
    }
}

/// Run `f`, retrying throttled failures according to `policy`.
pub async fn retry_throttled<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    retry_if(policy, operation, E::is_throttled, f).await
}

/// Run `f`, retrying failures for which `should_retry` holds.
pub async fn retry_if<T, E, F, Fut, P>(policy: &RetryPolicy, operation: &str, should_retry: P, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut retry = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && retry < policy.max_attempts => {
                let delay = policy.delay(retry);
                tracing::warn!(
                    operation,
                    attempt = retry + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => {
                if should_retry(&e) {
                    tracing::error!(operation, error = %e, "Still failing after all retries");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_millis(1500));
        assert_eq!(policy.delay(2), Duration::from_millis(2250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_throttling_until_success() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<&str, TaskerError> = retry_throttled(&RetryPolicy::default(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TaskerError::Throttled("slow down".to_string()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            interval: Duration::from_millis(10),
            backoff_rate: 2.0,
            max_attempts: 3,
        };

        let result: Result<(), GatewayError> = retry_throttled(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Throttled("Rate exceeded".to_string()))
        })
        .await;

        assert!(result.unwrap_err().is_throttled());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(1),
            backoff_rate: 10.0,
            max_attempts: 400,
        };
        assert_eq!(policy.delay(2), Duration::from_secs(100));
        assert_eq!(policy.delay(3), MAX_DELAY);
        assert_eq!(policy.delay(399), MAX_DELAY);

        let broken = RetryPolicy {
            backoff_rate: f64::NAN,
            ..RetryPolicy::default()
        };
        assert_eq!(broken.delay(1), MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_uses_caller_condition() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, TaskerError> = retry_if(
            &RetryPolicy::default(),
            "test",
            TaskerError::is_transient,
            || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(TaskerError::Queue("stream unavailable".to_string())),
                    n => Ok(n),
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), TaskerError> = retry_throttled(&RetryPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TaskerError::Gateway("syntax error".to_string()))
        })
        .await;

        assert!(matches!(result, Err(TaskerError::Gateway(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
