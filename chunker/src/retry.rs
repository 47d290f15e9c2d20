//! Exponential backoff retries of fallible asynchronous operations.

use std::future::Future;
use std::time::Duration;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each retry.
    ///
    /// A negative or NaN factor means retrying right away, an overflowing delay saturates.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    #[inline]
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self { max_retries, ..self }
    }

    #[inline]
    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self { initial_delay, ..self }
    }

    #[inline]
    pub fn with_backoff_multiplier(self, backoff_multiplier: f64) -> Self {
        Self {
            backoff_multiplier,
            ..self
        }
    }
}

/// Run `operation` until it succeeds or `config.max_retries` retries have failed, whatever the failure.
///
/// The last failure is returned once retries are exhausted.
///
/// ```
/// # tokio_test::block_on(async {
/// use std::time::Duration;
///
/// use chunker::retry::{with_retry, RetryConfig};
///
/// let config = RetryConfig::default().with_initial_delay(Duration::from_millis(1));
/// let mut attempts = 0;
///
/// let result = with_retry(
///     || {
///         attempts += 1;
///         let attempt = attempts;
///         async move { if attempt < 3 { Err("not yet") } else { Ok(attempt) } }
///     },
///     &config,
/// )
/// .await;
///
/// assert_eq!(result, Ok(3));
/// # })
/// ```
pub async fn with_retry<T, E, F, Fut>(operation: F, config: &RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_if(operation, config, |_| true).await
}

/// Run `operation` until it succeeds, `config.max_retries` retries have failed or `retryable` rejects a failure.
pub async fn with_retry_if<T, E, F, Fut, P>(mut operation: F, config: &RetryConfig, retryable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if retries == config.max_retries || !retryable(&err) => return Err(err),
            Err(_) => {
                retries += 1;

                tracing::warn!("Attempt #{retries} failed, retrying in {delay:?}...");

                tokio::time::sleep(delay).await;
                delay = backoff(delay, config.backoff_multiplier);
            }
        }
    }
}

/// Next retry delay, saturating to [`Duration::MAX`] and never below zero, even for a negative or NaN multiplier.
fn backoff(delay: Duration, multiplier: f64) -> Duration {
    let secs = delay.as_secs_f64() * multiplier;

    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
