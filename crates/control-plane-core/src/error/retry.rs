//! Retry logic with exponential backoff and jitter.
//!
//! Drives the optimistic-concurrency path of the aggregate lock manager:
//! a conflicting append is retried a bounded number of times with growing,
//! jittered delays so concurrent submitters do not stampede the store.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use super::ControlPlaneError;

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial retry delay.
    pub initial_delay: Duration,
    /// Upper bound applied after the exponential step.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub multiplier: f64,
    /// Jitter factor in `0.0..=1.0`, applied as `delay * (1 ± jitter)`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before the given attempt (1-based; attempt 0 is immediate).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let mut delay = self.initial_delay.as_millis() as f64;

        if self.multiplier > 1.0 {
            delay *= self.multiplier.powi(attempt as i32 - 1);
        }

        delay = delay.min(self.max_delay.as_millis() as f64);

        if self.jitter_factor > 0.0 {
            let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
            delay *= 1.0 + jitter;
        }

        Duration::from_millis(delay as u64)
    }

    /// Whether another attempt is allowed for this error.
    pub fn should_retry(&self, error: &ControlPlaneError, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts && error.is_retryable()
    }
}

/// Run an async operation under the given retry policy.
///
/// Non-retryable errors and the last conflict after exhaustion are returned
/// to the caller unchanged.
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ControlPlaneError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControlPlaneError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !policy.should_retry(&error, attempt) {
                    if attempt > 0 {
                        tracing::warn!(
                            error = %error,
                            attempts = attempt + 1,
                            "retries exhausted"
                        );
                    }
                    return Err(error);
                }

                let delay = policy.calculate_delay(attempt + 1);
                tracing::debug!(
                    error = %error,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );

                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn conflict() -> ControlPlaneError {
        ControlPlaneError::SequenceConflict {
            aggregate_id: "u-1".to_string(),
            expected: 1,
            current: 2,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(90), "delay {:?}", delay);
            assert!(delay <= Duration::from_millis(110), "delay {:?}", delay);
        }
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(500));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(500));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_conflict() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let result = retry_with_policy(&RetryPolicy::default(), move || {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_conflict() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let result: Result<(), _> = retry_with_policy(&RetryPolicy::default(), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(ControlPlaneError::SequenceConflict { .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let result: Result<(), _> = retry_with_policy(&RetryPolicy::default(), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(ControlPlaneError::validation("bad input"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
