//! Retry with exponential backoff around an arbitrary asynchronous operation.
use std::{future::Future, time::Duration};

use crate::Error;

/// Policy for [`retry`] and [`retry_with_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt. Each following delay is doubled.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Default value for [`RetryPolicy::max_attempts`].
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    /// Default value for [`RetryPolicy::backoff`].
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(1000);

    /// Create a new policy. `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, backoff: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A policy that performs exactly one attempt.
    pub fn single_attempt() -> RetryPolicy {
        RetryPolicy::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_BACKOFF)
    }
}

/// Errors that know whether repeating the failed operation can help.
pub trait Retryable {
    /// Returns `true` if the operation that produced this error may succeed when retried.
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        matches!(self, Error::Http { .. } | Error::Network(_))
    }
}

/// Delay to wait after the failed `attempt` (1-based): `backoff * 2^(attempt - 1)`.
pub fn backoff_delay(backoff: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    backoff.saturating_mul(factor)
}

/// Run `operation` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// Returns the error of the *last* attempt once attempts are exhausted. Errors that are not
/// [retryable](Retryable) are returned immediately.
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use feature_client::retry::{retry, RetryPolicy};
/// # async fn test() -> feature_client::Result<()> {
/// let value = retry(&RetryPolicy::new(3, Duration::from_millis(10)), || async {
///     Ok::<_, feature_client::Error>(42)
/// })
/// .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Clone,
{
    retry_with_callback(policy, operation, |_, _, _| async {}).await
}

/// Same as [`retry`] but invokes `on_retry(attempt, error, will_retry)` once per failed attempt,
/// including the final one (with `will_retry = false`). The returned future is awaited before
/// the backoff delay starts.
pub async fn retry_with_callback<T, E, F, Fut, C, CFut>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Clone,
    C: FnMut(u32, E, bool) -> CFut,
    CFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let will_retry = attempt < max_attempts && err.is_retryable();
        on_retry(attempt, err.clone(), will_retry).await;

        if !will_retry {
            return Err(err);
        }

        let delay = backoff_delay(policy.backoff, attempt);
        log::debug!(target: "feature_client",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64;
                    "retrying after error");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
