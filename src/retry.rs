//! Retry logic with exponential backoff
//!
//! This module provides the single retry policy shared by the batch fetcher and
//! the scanner. Delays grow exponentially, are capped, and receive additive
//! random jitter so that concurrent clients do not retry in lockstep.
//!
//! # Example
//!
//! ```no_run
//! use keyset_export::retry::{IsRetryable, with_retry};
//! use keyset_export::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Busy,
//!     Denied,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Busy)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{BackendError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (throttling, interrupted I/O) return `true`.
/// Permanent failures (bad credentials, malformed requests) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for BackendError {
    fn is_retryable(&self) -> bool {
        self.is_throttled()
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Backend(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Stage { source, .. } => source.is_retryable(),
            // An aborted fetch already classified its backend error as permanent
            Error::Fetch(_) => false,
            Error::Config { .. }
            | Error::Input(_)
            | Error::DestinationWrite { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Csv(_)
            | Error::Serialization(_)
            | Error::Other(_) => false,
        }
    }
}

/// The retry policy shared by the fetcher and the scanner
pub type RetryPolicy = RetryConfig;

impl RetryConfig {
    /// Exponential part of the delay before retry `retry` (zero-based), without jitter
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Full delay before retry `retry` (zero-based), jitter included
    pub fn delay_for(&self, retry: u32) -> Duration {
        add_jitter(self.backoff_delay(retry), self.jitter_max)
    }
}

/// Execute an async operation, retrying transient failures with backoff
///
/// `config.max_attempts` bounds the total number of calls, the first one
/// included. Returns the first success, the first non-retryable error, or the
/// last transient error once attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = config.delay_for(attempt - 1);

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Add uniform random jitter in `[0, jitter_max)` to a delay
fn add_jitter(delay: Duration, jitter_max: Duration) -> Duration {
    let bound = u64::try_from(jitter_max.as_nanos()).unwrap_or(u64::MAX);
    if bound == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..bound);
    delay.saturating_add(Duration::from_nanos(jitter))
}
