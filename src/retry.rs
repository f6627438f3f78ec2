//! Bounded retry with exponential backoff.
//!
//! [`RequestExecutor`](crate::RequestExecutor) wraps every HTTP call in
//! [`retry_with_backoff`] using the client's [`RetryPolicy`]. Transient
//! failures (connection errors, timeouts, 5xx) are retried; anything else
//! returns after the attempt that produced it.
//!
//! ```rust,no_run
//! use webui_chat::retry::{retry_with_backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::default()
//!     .with_max_retries(3)
//!     .with_initial_delay(Duration::from_millis(500));
//!
//! let models = retry_with_backoff(&policy, || async {
//!     Ok::<_, webui_chat::Error>(vec!["llama3"])
//! })
//! .await?;
//! println!("{:?}", models);
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How often and how patiently a request is repeated.
///
/// The wait before retry `n` (counting from zero) is
/// `initial_delay * backoff_multiplier^n`, capped at `max_delay`, then spread
/// by up to `±jitter_factor / 2` of itself.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as random spread, in `0.0..=1.0`
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    /// Three retries: roughly 1s, 2s, 4s apart.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries immediately, without sleeping between attempts.
    pub fn no_delay(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Total attempts this policy allows, including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry number `retry` (zero-based).
    fn backoff(&self, retry: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let growth = self.backoff_multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let base = self.initial_delay.as_secs_f64() * growth;
        let base = base.min(self.max_delay.as_secs_f64());

        let spread = base * self.jitter_factor;
        let offset = if spread > 0.0 {
            rand::random::<f64>() * spread - spread / 2.0
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

/// Whether `error` is worth another attempt.
///
/// True for transient failures only. A [`Error::RetriesExhausted`] is the
/// outcome of a finished retry loop and is never retried again.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::RetriesExhausted { .. } => false,
        other => other.is_transient(),
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the policy's
/// attempts are used up.
///
/// A permanent error comes back unchanged from the attempt that produced it.
/// When every attempt fails transiently, the last error is wrapped in
/// [`Error::RetriesExhausted`] with the number of attempts made.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable_error(&err) => return Err(err),
            Err(err) => err,
        };

        if attempt >= max_attempts {
            return Err(Error::RetriesExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let delay = policy.backoff(attempt - 1);
        log::warn!(
            "Attempt {}/{} failed: {}; retrying in {:?}",
            attempt,
            max_attempts,
            err,
            delay
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}
