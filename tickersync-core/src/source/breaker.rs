//! Circuit breaker in front of a data source.
//!
//! Trips after `threshold` consecutive failures, or at once when the source
//! blocks us (HTTP 403). While open, calls fail fast with a non-retryable
//! `Blocked` error until the cooldown has elapsed.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls are allowed.
    Closed,
    /// Calls are refused until `since + cooldown`.
    Open { since: Instant },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct SourceBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl SourceBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// `Ok(())` if a call may go out, otherwise the fail-fast error.
    ///
    /// An open breaker whose cooldown has passed closes here.
    pub fn check(&self) -> Result<(), SourceError> {
        let mut inner = self.lock();
        if let BreakerState::Open { since } = inner.state {
            let elapsed = since.elapsed();
            if elapsed < self.cooldown {
                let remaining = self.cooldown - elapsed;
                return Err(SourceError::blocked(format!(
                    "circuit breaker open for another {}s",
                    remaining.as_secs()
                )));
            }
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.threshold
            && matches!(inner.state, BreakerState::Closed)
        {
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "source circuit breaker tripped"
            );
            inner.state = BreakerState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Open immediately (the source has blocked us).
    pub fn trip(&self) {
        warn!(cooldown_secs = self.cooldown.as_secs(), "source blocked us, opening breaker");
        self.lock().state = BreakerState::Open {
            since: Instant::now(),
        };
    }

    pub fn remaining_cooldown(&self) -> Duration {
        match self.lock().state {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { since } => self.cooldown.saturating_sub(since.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceErrorKind;

    #[test]
    fn starts_closed() {
        let b = SourceBreaker::new(3, Duration::from_secs(60));
        assert!(b.check().is_ok());
        assert_eq!(b.remaining_cooldown(), Duration::ZERO);
    }

    #[test]
    fn opens_at_threshold() {
        let b = SourceBreaker::new(3, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        assert!(b.check().is_ok());
        b.record_failure();
        let err = b.check().unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Blocked);
        assert!(!err.is_transient());
    }

    #[test]
    fn success_resets_streak() {
        let b = SourceBreaker::new(2, Duration::from_secs(60));
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert!(b.check().is_ok());
    }

    #[test]
    fn trip_is_immediate_and_expires() {
        let b = SourceBreaker::new(3, Duration::from_millis(10));
        b.trip();
        assert!(b.check().is_err());
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
