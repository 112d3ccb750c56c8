//! Bounded exponential backoff for rate-limited external calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ServiceError, ServiceResult};

/// Retry budget for calls that may answer "too many requests".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            min_delay: Duration::from_secs(config.min_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based):
    /// `min(max_delay, max(min_delay, 2^(attempt-1) s))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let exponential = Duration::from_secs(1u64 << exponent);
        exponential.max(self.min_delay).min(self.max_delay)
    }
}

/// Run `operation`, retrying only rate-limited failures.
///
/// Any other error is returned immediately. Once `max_attempts` rate-limited
/// answers have been seen the last one is wrapped in
/// `ServiceError::RetriesExhausted`.
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut call: F,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_rate_limited() => {
                if attempt >= policy.max_attempts {
                    return Err(ServiceError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                let delay = match e.retry_after() {
                    Some(hint) => hint.max(policy.delay_for(attempt)).min(policy.max_delay),
                    None => policy.delay_for(attempt),
                };
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalServiceError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited() -> ServiceError {
        ExternalServiceError::RateLimited {
            service: "test",
            retry_after: None,
        }
        .into()
    }

    #[test]
    fn test_delay_schedule() {
        let policy = BackoffPolicy::default();
        let secs: Vec<u64> = (1..=8).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(secs, vec![4, 4, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retries_rate_limited_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_backoff(&BackoffPolicy::immediate(5), "probe", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(rate_limited())
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_hard_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: ServiceResult<()> =
            with_backoff(&BackoffPolicy::immediate(3), "submit", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(rate_limited())
            })
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: ServiceResult<()> =
            with_backoff(&BackoffPolicy::immediate(5), "render", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Internal {
                    message: "broken".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(ServiceError::Internal { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
