//! Retry policy shared by step definitions, the retry enhancer and schedule retries.

use crate::constants::defaults;
use crate::error::OrchestrationResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// `delay * 2^(attempt - 1)`, capped at `max_delay`
    Exponential,
}

/// Retry configuration for a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub delay: Duration,
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub max_delay: Duration,
    /// Only retry errors whose `is_retryable()` is true
    #[serde(default)]
    pub retryable_only: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            backoff: BackoffStrategy::Exponential,
            delay: defaults::RETRY_DELAY,
            max_delay: defaults::RETRY_MAX_DELAY,
            retryable_only: false,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed,
            delay,
            max_delay: delay.max(defaults::RETRY_MAX_DELAY),
            retryable_only: false,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential,
            delay,
            max_delay,
            retryable_only: false,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.delay
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max_attempts must be at least 1".to_string());
        }
        if self.max_delay < self.delay {
            return Err(format!(
                "retry max_delay ({}ms) must not be shorter than delay ({}ms)",
                self.max_delay.as_millis(),
                self.delay.as_millis()
            ));
        }
        Ok(())
    }
}

/// Run `attempt_fn` until it succeeds or the policy is exhausted.
///
/// Returns the final outcome together with the number of attempts made. The last
/// failure is surfaced unchanged when every attempt fails.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> (OrchestrationResult<T>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = OrchestrationResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match attempt_fn(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation, attempt = attempt, "Succeeded after retry");
                }
                return (Ok(value), attempt);
            }
            Err(error) => {
                let give_up = attempt >= max_attempts
                    || (policy.retryable_only && !error.is_retryable());
                if give_up {
                    return (Err(error), attempt);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), policy.delay_for(3));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_surfaces_last_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));

        let (result, attempts) = run_with_retry::<(), _, _>(&policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(OrchestrationError::generic(format!("failure {attempt}"))) }
        })
        .await;

        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("failure 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_only_stops_on_permanent_error() {
        let policy = RetryPolicy {
            retryable_only: true,
            ..RetryPolicy::fixed(5, Duration::from_millis(10))
        };

        let (result, attempts) = run_with_retry::<(), _, _>(&policy, "test", |_| async {
            Err(OrchestrationError::step_input_validation("/id", vec![]))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
