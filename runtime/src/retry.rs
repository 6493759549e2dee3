//! Bounded exponential backoff with jitter.
//!
//! An operation is attempted up to `max_attempts` times. After a failed
//! attempt that was not the last, the delay grows by a random fraction of
//! itself, is capped at `max_delay`, is slept, and then doubles for the next
//! round:
//!
//! ```text
//! delay = min(max_delay, delay + delay × random[0, 1))
//! sleep(delay)
//! delay = delay × 2
//! ```
//!
//! The sleep races the caller's cancellation future; whichever finishes first
//! wins.
//!
//! # Example
//!
//! ```rust
//! use correlate_runtime::retry::{execute, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(1))
//!     .build();
//!
//! let value = execute(&config, || async {
//!     // Your fallible operation here
//!     Ok::<_, std::io::Error>(42)
//! }).await?;
//! # assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Retry configuration.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 1 second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of calls to the operation (at least one is always made)
    pub max_attempts: u32,
    /// Delay seed for the first backoff
    pub initial_delay: Duration,
    /// Cap on a single backoff sleep
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryConfig {
    /// Create a new config builder.
    #[must_use]
    pub const fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
        }
    }

    /// Number of attempts actually made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl RetryConfigBuilder {
    /// Set maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the first backoff delay.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set the cap on a single backoff sleep.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`RetryConfig`].
    #[must_use]
    pub fn build(self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(1)),
        }
    }
}

/// Failure of a retried operation.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; `source` is the last error.
    #[error("Operation failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the last attempt
        source: E,
    },

    /// The caller cancelled while waiting between attempts.
    #[error("Operation cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// The last operation error, if the retries were exhausted.
    #[must_use]
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

/// One scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Number of the attempt that just failed (1-based).
    pub attempt: u32,
    /// Sleep before the next attempt.
    pub delay: Duration,
}

/// Backoff schedule of one [`execute`] call.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl Backoff {
    /// Start a schedule at the config's initial delay.
    #[must_use]
    pub const fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            max_delay: config.max_delay,
            attempt: 0,
        }
    }

    /// Compute the next sleep given a jitter fraction in `[0, 1)`.
    pub fn next_with_jitter(&mut self, jitter: f64) -> RetryAttempt {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.delay.min(self.max_delay);
        let jittered = base.saturating_add(base.mul_f64(jitter.clamp(0.0, 1.0)));
        let delay = jittered.min(self.max_delay);
        self.delay = delay.saturating_mul(2);
        RetryAttempt {
            attempt: self.attempt,
            delay,
        }
    }

    /// Compute the next sleep with random jitter.
    pub fn next_attempt(&mut self) -> RetryAttempt {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.next_with_jitter(jitter)
    }
}

/// Run `operation` with retries.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last error once every attempt failed.
pub async fn execute<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    execute_with_cancel(config, operation, std::future::pending::<()>()).await
}

/// Run `operation` with retries, aborting a backoff sleep when `cancelled` completes.
///
/// An attempt already in progress is never interrupted; cancellation only
/// takes effect between attempts.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] once every attempt failed, or
/// [`RetryError::Cancelled`] if `cancelled` completed during a backoff sleep.
pub async fn execute_with_cancel<F, Fut, T, E, C>(
    config: &RetryConfig,
    mut operation: F,
    cancelled: C,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Future<Output = ()>,
{
    let max_attempts = config.attempts();
    let mut backoff = Backoff::new(config);
    let mut cancelled = std::pin::pin!(cancelled);

    loop {
        let err = match operation().await {
            Ok(value) => {
                if backoff.attempt > 0 {
                    let attempt = backoff.attempt + 1;
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) => err,
        };

        if backoff.attempt + 1 >= max_attempts {
            RetryMetrics::record_exhausted();
            tracing::error!(
                attempts = max_attempts,
                error = %err,
                "Operation failed after max attempts"
            );
            return Err(RetryError::Exhausted {
                attempts: max_attempts,
                source: err,
            });
        }

        let next = backoff.next_attempt();
        RetryMetrics::record_attempt();
        tracing::warn!(
            attempt = next.attempt,
            delay_ms = next.delay.as_millis(),
            error = %err,
            "Operation failed, retrying..."
        );

        tokio::select! {
            () = &mut cancelled => {
                tracing::debug!(attempts = next.attempt, "Retry cancelled");
                return Err(RetryError::Cancelled { attempts: next.attempt });
            }
            () = sleep(next.delay) => {}
        }
    }
}
