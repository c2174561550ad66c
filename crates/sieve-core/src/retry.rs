//! Bounded retries for slow task steps.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Retry policy for an operation that may hang.
///
/// Each attempt gets a longer timeout than the last:
/// `base_timeout + attempt * timeout_step`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_timeout: Duration,
    pub timeout_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_timeout: Duration::from_secs(60),
            timeout_step: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_timeout: Duration) -> Self {
        Self {
            max_attempts,
            base_timeout,
            ..Self::default()
        }
    }

    pub fn with_timeout_step(mut self, step: Duration) -> Self {
        self.timeout_step = step;
        self
    }

    /// Timeout for a given attempt (0-indexed).
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        self.base_timeout + self.timeout_step * attempt
    }
}

/// Run `op` until it finishes within its attempt timeout.
///
/// Only timeouts are retried. An error returned by `op` is propagated
/// immediately. Once every attempt timed out the result is a task error
/// naming `label`.
pub async fn run_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    for attempt in 0..policy.max_attempts {
        let timeout = policy.attempt_timeout(attempt);
        match tokio::time::timeout(timeout, op(attempt)).await {
            Ok(result) => return result,
            Err(_) => {
                tracing::warn!(
                    %label,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    timeout_ms = timeout.as_millis() as u64,
                    "Attempt timed out"
                );
            }
        }
    }

    Err(AppError::Task(format!(
        "{label} timed out after {} attempts",
        policy.max_attempts
    )))
}
