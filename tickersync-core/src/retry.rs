//! Retry with exponential backoff.
//!
//! The policy is a plain value: no shared state, safe to use from any number
//! of threads at once. Whether a failure is worth another attempt is decided
//! by the error itself through [`Retryable`].

use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff without jitter: `base_delay * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delayed retries after the first attempt. Exhaustion means
    /// `max_retries + 1` calls and `max_retries` sleeps.
    pub max_retries: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Backoff after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned as-is.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with_sleep(op, std::thread::sleep)
    }

    /// Same as [`run`](Self::run) with an injectable sleep.
    pub fn run_with_sleep<T, E, F, S>(&self, mut op: F, mut sleep: S) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
        S: FnMut(Duration),
    {
        let attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
