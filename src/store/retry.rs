//! Bounded retry for optimistic-concurrency store operations
//!
//! A retried closure re-reads before it writes, so each attempt compares
//! against fresh state. Only conflicts and connectivity failures are retried;
//! when attempts run out the last failure surfaces as
//! [`Error::TransientStore`].

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::Error;
use crate::config::StoreConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub min_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            max_attempts: config.max_write_attempts.max(1),
            min_delay: config.retry_min_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Create an exponential backoff instance
    #[must_use]
    pub fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
            .build()
    }
}

/// Execute a store operation with retry logic
///
/// # Errors
///
/// Returns non-retryable errors from `f` immediately, and
/// [`Error::TransientStore`] once all attempts are exhausted.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut backoff = policy.create_backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                let delay = if attempts < policy.max_attempts {
                    backoff.next()
                } else {
                    None
                };

                let Some(delay) = delay else {
                    debug!(operation = name, attempts, error = %e, "Max retry attempts reached");
                    return Err(Error::TransientStore(format!(
                        "{name} failed after {attempts} attempts: {e}"
                    )));
                };

                debug!(
                    operation = name,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Check if an error is retryable
fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Store(e) => e.is_retryable(),
        _ => false,
    }
}
