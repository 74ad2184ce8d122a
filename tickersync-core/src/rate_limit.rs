//! Outbound call throttling.
//!
//! Every call to the external source passes through [`RateLimiter::acquire`].
//! Two rules are enforced:
//! - consecutive acquisitions are at least `min_interval` apart
//! - at most `max_concurrent` permits are outstanding (when a cap is set)
//!
//! The returned [`RatePermit`] releases on drop, so the release runs even when
//! the guarded call fails or panics.

use serde::{Deserialize, Serialize};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct LimiterState {
    last_request: Option<Instant>,
    in_flight: usize,
    total_requests: u64,
    total_wait: Duration,
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_wait_secs: f64,
    pub avg_wait_secs: f64,
    pub in_flight: usize,
}

/// Minimum-interval limiter with an optional concurrency cap.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    max_concurrent: Option<usize>,
    state: Mutex<LimiterState>,
    slot_freed: Condvar,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, max_concurrent: Option<usize>) -> Self {
        Self {
            min_interval,
            max_concurrent: max_concurrent.filter(|&n| n > 0),
            state: Mutex::new(LimiterState::default()),
            slot_freed: Condvar::new(),
        }
    }

    /// No interval, no cap. Useful for tests and offline runs.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, None)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.max_concurrent
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a call may proceed, then hand out a permit.
    ///
    /// The first acquisition ever never waits.
    pub fn acquire(&self) -> RatePermit<'_> {
        let requested_at = Instant::now();
        let mut state = self.lock();

        if let Some(cap) = self.max_concurrent {
            while state.in_flight >= cap {
                state = self
                    .slot_freed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        // Reserve our start time while holding the lock so concurrent callers
        // queue behind it instead of all reading the same `last_request`.
        let now = Instant::now();
        let start_at = match state.last_request {
            None => now,
            Some(last) => now.max(last + self.min_interval),
        };
        state.last_request = Some(start_at);
        state.in_flight += 1;
        state.total_requests += 1;
        drop(state);

        let sleep_for = start_at.saturating_duration_since(Instant::now());
        if !sleep_for.is_zero() {
            debug!(wait_ms = sleep_for.as_millis() as u64, "rate limiter waiting");
            std::thread::sleep(sleep_for);
        }

        RatePermit {
            limiter: self,
            waited: requested_at.elapsed(),
        }
    }

    /// Run `f` while holding a permit.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _permit = self.acquire();
        f()
    }

    fn release(&self, waited: Duration) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        let now = Instant::now();
        state.last_request = Some(match state.last_request {
            Some(last) if last > now => last,
            _ => now,
        });
        state.total_wait += waited;
        drop(state);
        self.slot_freed.notify_one();
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.lock();
        let total_wait_secs = state.total_wait.as_secs_f64();
        let avg_wait_secs = if state.total_requests == 0 {
            0.0
        } else {
            total_wait_secs / state.total_requests as f64
        };
        RateLimiterStats {
            total_requests: state.total_requests,
            total_wait_secs,
            avg_wait_secs,
            in_flight: state.in_flight,
        }
    }

    /// Zero the counters. Timing state and outstanding permits are untouched.
    pub fn reset_stats(&self) {
        let mut state = self.lock();
        state.total_requests = 0;
        state.total_wait = Duration::ZERO;
    }
}

/// Scoped permit returned by [`RateLimiter::acquire`].
#[must_use = "the permit is released as soon as it is dropped"]
#[derive(Debug)]
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
    waited: Duration,
}

impl RatePermit<'_> {
    /// Time spent blocked in `acquire`.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        self.limiter.release(self.waited);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn first_acquire_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(10), None);
        let start = Instant::now();
        let permit = limiter.acquire();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(permit.waited() < Duration::from_secs(1));
    }

    #[test]
    fn consecutive_acquires_respect_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(50), None);
        let first = Instant::now();
        drop(limiter.acquire());
        drop(limiter.acquire());
        assert!(first.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn release_runs_when_guarded_call_fails() {
        let limiter = RateLimiter::new(Duration::ZERO, Some(1));
        let result: Result<(), &str> = limiter.run(|| Err("boom"));
        assert!(result.is_err());
        assert_eq!(limiter.stats().in_flight, 0);
        // A second acquire would deadlock if the slot leaked.
        drop(limiter.acquire());
    }

    #[test]
    fn concurrency_cap_is_never_exceeded() {
        let limiter = Arc::new(RateLimiter::new(Duration::ZERO, Some(2)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    limiter.run(|| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.stats().total_requests, 8);
        assert_eq!(limiter.stats().in_flight, 0);
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let limiter = RateLimiter::new(Duration::from_millis(20), None);
        drop(limiter.acquire());
        drop(limiter.acquire());
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 2);
        assert!(stats.total_wait_secs > 0.0);
        assert!(stats.avg_wait_secs > 0.0);

        limiter.reset_stats();
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.total_wait_secs, 0.0);
        assert_eq!(stats.avg_wait_secs, 0.0);

        // Timing state survives the reset.
        let start = Instant::now();
        drop(limiter.acquire());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn zero_cap_means_uncapped() {
        let limiter = RateLimiter::new(Duration::ZERO, Some(0));
        assert_eq!(limiter.max_concurrent(), None);
        let _a = limiter.acquire();
        let _b = limiter.acquire();
        assert_eq!(limiter.stats().in_flight, 2);
    }
}
