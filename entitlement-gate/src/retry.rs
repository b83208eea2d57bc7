//! Bounded exponential backoff for conditional-write races.
//!
//! Two concurrently processed deliveries of the same event can race on one
//! record; the loser re-reads and retries. Retries are bounded and short
//! because the webhook must be acknowledged quickly: on exhaustion the
//! caller acknowledges anyway and flags the event for manual
//! reconciliation.

use std::future::Future;
use std::time::Duration;

use crate::error::GateError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default: 3).
    pub max_attempts: u32,
    /// Initial delay between attempts (default: 20ms).
    pub initial_delay: Duration,
    /// Cap on the delay between attempts (default: 250ms).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom maximum attempts.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts, ..Self::default() }
    }

    /// Delay before the retry following `attempt` (zero-based).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(
            clippy::cast_precision_loss,
            reason = "acceptable for duration calculations"
        )]
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.try_into().unwrap_or(i32::MAX));
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "delay_ms is positive and bounded by max_delay below"
        )]
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// Whether an error can be cured by retrying.
///
/// Only write conflicts are transient; everything else either reflects bad
/// input or an invariant violation that a retry would merely repeat.
#[must_use]
pub fn is_retryable(error: &GateError) -> bool {
    matches!(error, GateError::WriteConflict { .. })
}

/// Executes `operation` with exponential backoff, retrying only errors that
/// [`is_retryable`] accepts.
///
/// # Errors
///
/// Returns the first non-retryable error immediately, or the last error
/// after `max_attempts` retryable failures.
pub async fn retry_conflicts<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, GateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GateError>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if is_retryable(&error) => {
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "write conflict, retrying"
                );
                last_error = Some(error);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
            Err(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        GateError::InvalidOperation("retry policy allows zero attempts".into())
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn conflict() -> GateError {
        GateError::WriteConflict { entity: "subscription sub-1".into(), expected: 0, found: 1 }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(20));
    }

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(80));
        // Capped.
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(250));
    }

    #[test]
    fn test_only_write_conflicts_are_retryable() {
        assert!(is_retryable(&conflict()));
        assert!(!is_retryable(&GateError::MalformedEvent("x".into())));
        assert!(!is_retryable(&GateError::NotFound("subscription sub-1".into())));
        assert!(!is_retryable(&GateError::DuplicateEntitlement {
            principal_id: "p".into(),
            assistant_id: "a".into(),
        }));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_conflicts() {
        let policy = RetryPolicy::with_max_attempts(3);
        let attempts = AtomicU32::new(0);

        let result = retry_conflicts(&policy, || async {
            let n = attempts.fetch_add(1, Ordering::Relaxed);
            if n < 2 { Err(conflict()) } else { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_conflict() {
        let policy = RetryPolicy::with_max_attempts(2);
        let attempts = AtomicU32::new(0);

        let result: Result<u32, _> = retry_conflicts(&policy, || async {
            attempts.fetch_add(1, Ordering::Relaxed);
            Err(conflict())
        })
        .await;

        assert!(matches!(result.unwrap_err(), GateError::WriteConflict { .. }));
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::with_max_attempts(5);
        let attempts = AtomicU32::new(0);

        let result: Result<u32, _> = retry_conflicts(&policy, || async {
            attempts.fetch_add(1, Ordering::Relaxed);
            Err(GateError::NotFound("subscription ghost".into()))
        })
        .await;

        assert!(matches!(result.unwrap_err(), GateError::NotFound(_)));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }
}
