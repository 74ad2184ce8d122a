//! Gap-aware sync orchestrator.
//!
//! Every read-with-possible-fetch goes through [`SyncOrchestrator::ensure_coverage`]:
//!
//! ```text
//! CHECK_RANGE ─┬─ sufficient ───────────────────────────┐
//!              └─ insufficient → FETCHING → RE-READ ────┴→ done
//! ```
//!
//! When the stored range does not cover the request, the *whole* requested
//! window is fetched again, not just the missing edges. That costs extra
//! external calls and keeps the decision trivial.
//!
//! Each fetch attempt passes the shared rate limiter; transient failures are
//! retried with backoff. If the source stays unavailable the caller still gets
//! whatever the store holds, with the source error attached. Store errors are
//! never swallowed.
//!
//! Concurrent calls for the same ticker may both fetch. Writes are idempotent
//! upserts, so the duplicate work is accepted.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{FetchError, SourceError, StoreError, SyncError};
use crate::progress::{ProgressStore, SyncPhase, SyncProgress};
use crate::rate_limit::RateLimiter;
use crate::record::{span_days, DailyBar, DataRange, FetchRequest, SyncRequest};
use crate::retry::RetryPolicy;
use crate::source::{fetch_and_persist, Source};
use crate::store::RecordStore;

/// Steps reported to the progress store: check, fetch, re-read.
const PROGRESS_STEPS: usize = 3;

/// Outcome of the coverage check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FetchPlan {
    /// Stored coverage contains the request.
    Sufficient,
    /// Nothing stored for the ticker.
    Missing { fetch_days: u32 },
    /// Stored coverage misses the start and/or the end of the request.
    Partial { covered: DataRange, fetch_days: u32 },
}

impl FetchPlan {
    pub fn decide(range: Option<&DataRange>, start: NaiveDate, end: NaiveDate) -> Self {
        let fetch_days = span_days(start, end);
        match range {
            None => FetchPlan::Missing { fetch_days },
            Some(r) if r.min_date > start || r.max_date < end => FetchPlan::Partial {
                covered: r.clone(),
                fetch_days,
            },
            Some(_) => FetchPlan::Sufficient,
        }
    }

    pub fn needs_fetch(&self) -> bool {
        !matches!(self, FetchPlan::Sufficient)
    }

    pub fn fetch_days(&self) -> Option<u32> {
        match self {
            FetchPlan::Sufficient => None,
            FetchPlan::Missing { fetch_days } | FetchPlan::Partial { fetch_days, .. } => {
                Some(*fetch_days)
            }
        }
    }
}

/// Result of one `ensure_coverage` call.
#[derive(Debug)]
pub struct SyncOutcome<T> {
    pub ticker: String,
    pub records: T,
    pub plan: FetchPlan,
    /// Rows newly persisted by the fetch. `None` when no fetch succeeded.
    pub fetched: Option<usize>,
    /// Set when the fetch failed and `records` is best-available data.
    pub source_error: Option<SourceError>,
}

impl<T> SyncOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        self.source_error.is_some()
    }
}

pub struct SyncOrchestrator {
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    progress: Option<Arc<ProgressStore>>,
}

impl SyncOrchestrator {
    pub fn new(limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            limiter,
            retry,
            progress: None,
        }
    }

    /// Publish phases for requests that carry a task id.
    pub fn with_progress(mut self, progress: Arc<ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn publish(&self, req: &SyncRequest, phase: SyncPhase, step: usize, message: Option<String>) {
        let (Some(progress), Some(task_id)) = (&self.progress, &req.task_id) else {
            return;
        };
        let mut snapshot = SyncProgress::new(phase, step, PROGRESS_STEPS).for_ticker(&req.ticker);
        snapshot.message = message;
        progress.update(task_id.clone(), snapshot);
    }

    /// Make sure the store covers `req`, fetching if it does not, then read.
    ///
    /// - `range_fn(ticker)` reports stored coverage
    /// - `fetch_fn(&FetchRequest)` pulls and persists, returning new row count
    /// - `read_fn(ticker, start, end)` produces the result
    ///
    /// A fetch that persists zero rows is final for this call.
    pub fn ensure_coverage<T, Read, Range, Fetch>(
        &self,
        req: &SyncRequest,
        read_fn: Read,
        range_fn: Range,
        mut fetch_fn: Fetch,
    ) -> Result<SyncOutcome<T>, SyncError>
    where
        Read: FnOnce(&str, NaiveDate, NaiveDate) -> Result<T, StoreError>,
        Range: FnOnce(&str) -> Result<Option<DataRange>, StoreError>,
        Fetch: FnMut(&FetchRequest) -> Result<usize, FetchError>,
    {
        let ticker = req.ticker.as_str();

        self.publish(req, SyncPhase::CheckRange, 0, None);
        let range = range_fn(ticker).map_err(|e| self.fail(req, e))?;
        let plan = FetchPlan::decide(range.as_ref(), req.start, req.end);

        let mut fetched = None;
        let mut source_error = None;

        if let Some(fetch_days) = plan.fetch_days() {
            info!(
                ticker,
                start = %req.start,
                end = %req.end,
                fetch_days,
                covered = ?range.as_ref().map(|r| (r.min_date, r.max_date)),
                "coverage insufficient, fetching"
            );
            self.publish(req, SyncPhase::Fetching, 1, None);

            let request = FetchRequest {
                ticker: ticker.to_string(),
                fetch_days,
                start: req.start,
                end: req.end,
            };
            let result = self.retry.run(|attempt| {
                let _permit = self.limiter.acquire();
                debug!(ticker, attempt, "fetch attempt");
                fetch_fn(&request)
            });

            match result {
                Ok(inserted) => fetched = Some(inserted),
                Err(FetchError::Store(e)) => return Err(self.fail(req, e)),
                Err(FetchError::Source(e)) => {
                    warn!(ticker, error = %e, "source unavailable, serving stored data");
                    source_error = Some(e);
                }
            }
            self.publish(
                req,
                SyncPhase::Rereading,
                2,
                fetched.map(|n| format!("{n} new rows")),
            );
        } else {
            debug!(ticker, start = %req.start, end = %req.end, "coverage sufficient");
        }

        let records = read_fn(ticker, req.start, req.end).map_err(|e| self.fail(req, e))?;

        let message = match (&source_error, fetched) {
            (Some(e), _) => Some(format!("degraded: {e}")),
            (None, Some(n)) => Some(format!("{n} new rows")),
            (None, None) => None,
        };
        self.publish(req, SyncPhase::Done, PROGRESS_STEPS, message);

        Ok(SyncOutcome {
            ticker: ticker.to_string(),
            records,
            plan,
            fetched,
            source_error,
        })
    }

    /// `ensure_coverage` wired to a store and a source.
    pub fn sync_with(
        &self,
        req: &SyncRequest,
        store: &dyn RecordStore,
        source: &dyn Source,
    ) -> Result<SyncOutcome<Vec<DailyBar>>, SyncError> {
        self.ensure_coverage(
            req,
            |ticker, start, end| store.read(ticker, start, end),
            |ticker| store.range(ticker),
            |request| fetch_and_persist(source, store, request),
        )
    }

    fn fail(&self, req: &SyncRequest, e: StoreError) -> SyncError {
        self.publish(req, SyncPhase::Failed, 0, Some(e.to_string()));
        SyncError::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceErrorKind;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn range(min: NaiveDate, max: NaiveDate) -> DataRange {
        DataRange {
            ticker: "SPY".into(),
            min_date: min,
            max_date: max,
            count: 10,
        }
    }

    fn orchestrator() -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::new(RateLimiter::unlimited()),
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
    }

    #[test]
    fn plan_missing_when_absent() {
        let plan = FetchPlan::decide(None, d(2025, 1, 1), d(2025, 1, 10));
        assert_eq!(plan, FetchPlan::Missing { fetch_days: 10 });
    }

    #[test]
    fn plan_partial_fetches_full_span() {
        let covered = range(d(2025, 1, 1), d(2025, 11, 1));
        let plan = FetchPlan::decide(Some(&covered), d(2025, 1, 1), d(2025, 11, 11));
        assert_eq!(plan.fetch_days(), Some(315));
        assert!(matches!(plan, FetchPlan::Partial { .. }));
    }

    #[test]
    fn plan_partial_on_leading_gap() {
        let covered = range(d(2025, 2, 1), d(2025, 3, 1));
        let plan = FetchPlan::decide(Some(&covered), d(2025, 1, 15), d(2025, 2, 15));
        assert!(plan.needs_fetch());
    }

    #[test]
    fn plan_sufficient_when_contained() {
        let covered = range(d(2025, 1, 1), d(2025, 12, 31));
        let plan = FetchPlan::decide(Some(&covered), d(2025, 3, 1), d(2025, 3, 31));
        assert_eq!(plan, FetchPlan::Sufficient);
        assert_eq!(plan.fetch_days(), None);
    }

    #[test]
    fn no_fetch_when_covered() {
        let req = SyncRequest::new("SPY", d(2025, 3, 1), d(2025, 3, 31)).unwrap();
        let fetches = Cell::new(0);
        let out = orchestrator()
            .ensure_coverage(
                &req,
                |_, _, _| Ok(vec![1, 2, 3]),
                |_| Ok(Some(range(d(2025, 1, 1), d(2025, 12, 31)))),
                |_| {
                    fetches.set(fetches.get() + 1);
                    Ok(0)
                },
            )
            .unwrap();
        assert_eq!(fetches.get(), 0);
        assert_eq!(out.records, vec![1, 2, 3]);
        assert_eq!(out.fetched, None);
        assert!(!out.is_degraded());
    }

    #[test]
    fn fetch_receives_full_window() {
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 11, 11)).unwrap();
        let seen = RefCell::new(Vec::new());
        let out = orchestrator()
            .ensure_coverage(
                &req,
                |_, _, _| Ok(()),
                |_| Ok(Some(range(d(2025, 1, 1), d(2025, 11, 1)))),
                |r| {
                    seen.borrow_mut().push(r.clone());
                    Ok(7)
                },
            )
            .unwrap();
        let seen = seen.into_inner();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].fetch_days, 315);
        assert_eq!(seen[0].start, d(2025, 1, 1));
        assert_eq!(seen[0].end, d(2025, 11, 11));
        assert_eq!(out.fetched, Some(7));
    }

    #[test]
    fn source_failure_degrades_to_stored_data() {
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 1, 31)).unwrap();
        let attempts = Cell::new(0);
        let out = orchestrator()
            .ensure_coverage(
                &req,
                |_, _, _| Ok(vec!["stale"]),
                |_| Ok(None),
                |_| {
                    attempts.set(attempts.get() + 1);
                    Err(FetchError::Source(SourceError::timeout("slow")))
                },
            )
            .unwrap();
        // First call plus three delayed retries.
        assert_eq!(attempts.get(), 4);
        assert!(out.is_degraded());
        assert_eq!(out.records, vec!["stale"]);
        assert_eq!(
            out.source_error.as_ref().map(|e| e.kind),
            Some(SourceErrorKind::Timeout)
        );
    }

    #[test]
    fn non_transient_source_failure_is_not_retried() {
        let req = SyncRequest::new("ZZZZ", d(2025, 1, 1), d(2025, 1, 31)).unwrap();
        let attempts = Cell::new(0);
        let out = orchestrator()
            .ensure_coverage(
                &req,
                |_, _, _| Ok(Vec::<u8>::new()),
                |_| Ok(None),
                |_| {
                    attempts.set(attempts.get() + 1);
                    Err(FetchError::Source(SourceError::not_found("ZZZZ")))
                },
            )
            .unwrap();
        assert_eq!(attempts.get(), 1);
        assert!(out.records.is_empty());
        assert!(out.is_degraded());
    }

    #[test]
    fn store_errors_propagate() {
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 1, 31)).unwrap();

        let err = orchestrator()
            .ensure_coverage(
                &req,
                |_, _, _| Ok(()),
                |_| Err(StoreError::Io("disk".into())),
                |_| Ok(0),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));

        let err = orchestrator()
            .ensure_coverage(
                &req,
                |_, _, _| Ok(()),
                |_| Ok(None),
                |_| Err(FetchError::Store(StoreError::Io("disk".into()))),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
    }

    #[test]
    fn zero_row_fetch_is_accepted() {
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 1, 31)).unwrap();
        let attempts = Cell::new(0);
        let out = orchestrator()
            .ensure_coverage(
                &req,
                |_, _, _| Ok(0usize),
                |_| Ok(None),
                |_| {
                    attempts.set(attempts.get() + 1);
                    Ok(0)
                },
            )
            .unwrap();
        assert_eq!(attempts.get(), 1);
        assert_eq!(out.fetched, Some(0));
        assert!(!out.is_degraded());
    }

    #[test]
    fn progress_published_for_task() {
        let progress = Arc::new(ProgressStore::new());
        let orch = orchestrator().with_progress(Arc::clone(&progress));
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 1, 31))
            .unwrap()
            .with_task_id("job-1");

        orch.ensure_coverage(&req, |_, _, _| Ok(()), |_| Ok(None), |_| Ok(4))
            .unwrap();

        let snap = progress.get("job-1").unwrap();
        assert_eq!(snap.phase, SyncPhase::Done);
        assert_eq!(snap.processed, PROGRESS_STEPS);
        assert_eq!(snap.ticker.as_deref(), Some("SPY"));
        assert_eq!(snap.message.as_deref(), Some("4 new rows"));
    }

    #[test]
    fn failure_is_published() {
        let progress = Arc::new(ProgressStore::new());
        let orch = orchestrator().with_progress(Arc::clone(&progress));
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 1, 31))
            .unwrap()
            .with_task_id("job-2");

        let _ = orch.ensure_coverage(
            &req,
            |_, _, _| Ok(()),
            |_| Err(StoreError::Io("gone".into())),
            |_| Ok(0),
        );
        assert_eq!(progress.get("job-2").unwrap().phase, SyncPhase::Failed);
    }

    #[test]
    fn untracked_requests_publish_nothing() {
        let progress = Arc::new(ProgressStore::new());
        let orch = orchestrator().with_progress(Arc::clone(&progress));
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 1, 31)).unwrap();
        orch.ensure_coverage(&req, |_, _, _| Ok(()), |_| Ok(None), |_| Ok(1))
            .unwrap();
        assert!(progress.is_empty());
    }

    #[test]
    fn every_attempt_passes_the_limiter() {
        let limiter = Arc::new(RateLimiter::unlimited());
        let orch = SyncOrchestrator::new(
            Arc::clone(&limiter),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        let req = SyncRequest::new("SPY", d(2025, 1, 1), d(2025, 1, 2)).unwrap();
        let attempts = Cell::new(0);
        orch.ensure_coverage(
            &req,
            |_, _, _| Ok(()),
            |_| Ok(None),
            |_| {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 3 {
                    Err(FetchError::Source(SourceError::network("reset")))
                } else {
                    Ok(2)
                }
            },
        )
        .unwrap();
        assert_eq!(limiter.stats().total_requests, 3);
        assert_eq!(limiter.stats().in_flight, 0);
    }
}
