//! Composition root.
//!
//! [`SyncService`] owns one instance of every shared component (store,
//! source, cache, rate limiter, progress store) and wires them into the
//! orchestrator. Nothing here is global: build one service per process and
//! share it by reference or `Arc`.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache_key::cache_key;
use crate::config::SyncConfig;
use crate::error::{SourceError, SyncError};
use crate::progress::{ProgressStore, SyncProgress};
use crate::rate_limit::{RateLimiter, RateLimiterStats};
use crate::record::{normalize_ticker, DailyBar, DataRange, SyncRequest};
use crate::retry::RetryPolicy;
use crate::source::{Source, SourceBreaker, YahooSource};
use crate::store::{ParquetStore, RecordStore};
use crate::sweep::{self, SweepSummary};
use crate::sync::{SyncOrchestrator, SyncOutcome};
use crate::ttl_cache::{CacheStats, TtlCache};

/// Namespace of cached bar answers.
pub const BARS_NAMESPACE: &str = "bars";

/// Cache of read answers, shared between callers.
pub type BarCache = TtlCache<Arc<Vec<DailyBar>>>;

/// Answer of [`SyncService::bars`].
#[derive(Debug, Clone)]
pub struct BarsAnswer {
    pub ticker: String,
    pub bars: Arc<Vec<DailyBar>>,
    /// Served from the cache without touching the store.
    pub from_cache: bool,
    /// The source failed; `bars` is whatever the store held.
    pub source_error: Option<SourceError>,
}

impl BarsAnswer {
    pub fn is_degraded(&self) -> bool {
        self.source_error.is_some()
    }
}

#[derive(Serialize)]
struct WindowParams {
    start: NaiveDate,
    end: NaiveDate,
}

/// Cache key for the bars of `req`: `bars:<TICKER>:<digest>`.
pub fn bars_key(req: &SyncRequest) -> String {
    cache_key(
        BARS_NAMESPACE,
        &req.ticker,
        &WindowParams {
            start: req.start,
            end: req.end,
        },
    )
}

/// Substring matching every cached answer for `ticker` and nothing else.
fn ticker_pattern(ticker: &str) -> String {
    format!(":{ticker}:")
}

pub struct SyncService {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn Source>,
    cache: Arc<BarCache>,
    limiter: Arc<RateLimiter>,
    progress: Arc<ProgressStore>,
    orchestrator: SyncOrchestrator,
    workers: usize,
}

impl SyncService {
    /// Build a service over `store` and `source` with components from `config`.
    pub fn new(store: Arc<dyn RecordStore>, source: Arc<dyn Source>, config: &SyncConfig) -> Self {
        Self::from_parts(
            store,
            source,
            Arc::new(TtlCache::new(config.cache.max_size, config.default_ttl())),
            Arc::new(config.rate_limit.build()),
            config.retry.policy(),
        )
        .with_workers(config.sweep.workers)
    }

    /// Build a service from already-constructed components.
    pub fn from_parts(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn Source>,
        cache: Arc<BarCache>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        let progress = Arc::new(ProgressStore::new());
        let orchestrator =
            SyncOrchestrator::new(Arc::clone(&limiter), retry).with_progress(Arc::clone(&progress));
        Self {
            store,
            source,
            cache,
            limiter,
            progress,
            orchestrator,
            workers: 1,
        }
    }

    /// Parquet store under `config.store.dir`, Yahoo Finance as the source.
    pub fn open(config: &SyncConfig) -> Result<Self, SourceError> {
        let breaker = Arc::new(SourceBreaker::new(
            config.source.breaker_threshold,
            config.breaker_cooldown(),
        ));
        let source = YahooSource::new(breaker, config.source_timeout(), &config.source.user_agent)?;
        let store = ParquetStore::new(&config.store.dir);
        info!(dir = %config.store.dir.display(), source = source.name(), "sync service ready");
        Ok(Self::new(Arc::new(store), Arc::new(source), config))
    }

    /// Threads used by [`sweep`](Self::sweep). At least one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &BarCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Cached read. On a miss the request goes through the orchestrator and
    /// the answer is cached unless the source failed.
    pub fn bars(&self, req: &SyncRequest) -> Result<BarsAnswer, SyncError> {
        let key = bars_key(req);
        if let Some(bars) = self.cache.get(&key) {
            return Ok(BarsAnswer {
                ticker: req.ticker.clone(),
                bars,
                from_cache: true,
                source_error: None,
            });
        }

        let outcome = self.sync(req)?;
        let bars = Arc::new(outcome.records);
        if outcome.source_error.is_none() {
            self.cache.set(key, Arc::clone(&bars), None);
        } else {
            debug!(ticker = %req.ticker, "degraded answer not cached");
        }

        Ok(BarsAnswer {
            ticker: outcome.ticker,
            bars,
            from_cache: false,
            source_error: outcome.source_error,
        })
    }

    /// Uncached sync. New rows invalidate every cached answer for the ticker.
    pub fn sync(&self, req: &SyncRequest) -> Result<SyncOutcome<Vec<DailyBar>>, SyncError> {
        let outcome = self
            .orchestrator
            .sync_with(req, self.store.as_ref(), self.source.as_ref())?;
        if outcome.fetched.is_some_and(|n| n > 0) {
            self.invalidate_ticker(&outcome.ticker);
        }
        Ok(outcome)
    }

    /// Drop cached answers for `ticker`. Returns how many were removed.
    pub fn invalidate_ticker(&self, ticker: &str) -> usize {
        self.cache.invalidate_pattern(&ticker_pattern(ticker))
    }

    /// Sync the trailing `days` of each ticker, ending today.
    pub fn sweep(&self, tickers: &[String], days: u32) -> Result<SweepSummary, SyncError> {
        self.sweep_until(tickers, days, chrono::Local::now().date_naive())
    }

    /// Sync the trailing `days` of each ticker, ending at `end`.
    pub fn sweep_until(
        &self,
        tickers: &[String],
        days: u32,
        end: NaiveDate,
    ) -> Result<SweepSummary, SyncError> {
        sweep::run(self, tickers, days, end)
    }

    /// Stored coverage for `ticker`.
    pub fn coverage(&self, ticker: &str) -> Result<Option<DataRange>, SyncError> {
        let ticker = normalize_ticker(ticker)?;
        Ok(self.store.range(&ticker)?)
    }

    pub fn progress(&self, task_id: &str) -> Option<SyncProgress> {
        self.progress.get(task_id)
    }

    pub fn clear_progress(&self, task_id: &str) -> Option<SyncProgress> {
        self.progress.clear(task_id)
    }

    pub(crate) fn progress_store(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceErrorKind;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    /// One flat bar per calendar day in the requested window.
    #[derive(Default)]
    struct DailySource {
        calls: AtomicUsize,
        down: AtomicBool,
    }

    impl Source for DailySource {
        fn name(&self) -> &str {
            "daily"
        }

        fn fetch(
            &self,
            _ticker: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<DailyBar>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(SourceError::new(SourceErrorKind::Http(404), "gone"));
            }
            Ok(start
                .iter_days()
                .take_while(|day| *day <= end)
                .map(|day| DailyBar::flat(day, 100.0, 10))
                .collect())
        }
    }

    fn service(source: Arc<DailySource>) -> (SyncService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let svc = SyncService::from_parts(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            source,
            Arc::new(TtlCache::new(16, Duration::from_secs(60))),
            Arc::new(RateLimiter::unlimited()),
            RetryPolicy::new(0, Duration::ZERO),
        );
        (svc, store)
    }

    #[test]
    fn bars_key_is_namespaced_by_ticker() {
        let req = SyncRequest::new("spy", d(1), d(5)).unwrap();
        let key = bars_key(&req);
        assert!(key.starts_with("bars:SPY:"));
        assert!(key.contains(&ticker_pattern("SPY")));
        assert!(!key.contains(&ticker_pattern("SP")));
    }

    #[test]
    fn second_read_is_served_from_cache() {
        let source = Arc::new(DailySource::default());
        let (svc, _) = service(Arc::clone(&source));
        let req = SyncRequest::new("SPY", d(1), d(5)).unwrap();

        let first = svc.bars(&req).unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.bars.len(), 5);

        let second = svc.bars(&req).unwrap();
        assert!(second.from_cache);
        assert_eq!(second.bars, first.bars);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.cache_stats().hits, 1);
    }

    #[test]
    fn new_rows_invalidate_cached_answers() {
        let source = Arc::new(DailySource::default());
        let (svc, _) = service(Arc::clone(&source));

        let narrow = SyncRequest::new("SPY", d(1), d(5)).unwrap();
        svc.bars(&narrow).unwrap();
        svc.bars(&SyncRequest::new("QQQ", d(1), d(5)).unwrap()).unwrap();
        assert_eq!(svc.cache().len(), 2);

        // Extends coverage, so the SPY answer must go; QQQ stays.
        let outcome = svc.sync(&SyncRequest::new("SPY", d(1), d(10)).unwrap()).unwrap();
        assert_eq!(outcome.fetched, Some(5));
        assert!(svc.cache().get(&bars_key(&narrow)).is_none());
        assert_eq!(svc.cache().len(), 1);
    }

    #[test]
    fn degraded_answers_are_not_cached() {
        let source = Arc::new(DailySource::default());
        source.down.store(true, Ordering::SeqCst);
        let (svc, _) = service(Arc::clone(&source));
        let req = SyncRequest::new("SPY", d(1), d(5)).unwrap();

        let answer = svc.bars(&req).unwrap();
        assert!(answer.is_degraded());
        assert!(answer.bars.is_empty());
        assert!(svc.cache().is_empty());

        source.down.store(false, Ordering::SeqCst);
        let answer = svc.bars(&req).unwrap();
        assert!(!answer.is_degraded());
        assert_eq!(answer.bars.len(), 5);
    }

    #[test]
    fn coverage_normalizes_ticker() {
        let source = Arc::new(DailySource::default());
        let (svc, _) = service(source);
        svc.sync(&SyncRequest::new("SPY", d(1), d(3)).unwrap()).unwrap();

        let range = svc.coverage(" spy ").unwrap().unwrap();
        assert_eq!((range.min_date, range.max_date, range.count), (d(1), d(3), 3));
        assert!(svc.coverage("QQQ").unwrap().is_none());
        assert!(svc.coverage("bad ticker").unwrap_err().is_validation());
    }

    #[test]
    fn tracked_sync_leaves_progress_until_cleared() {
        let source = Arc::new(DailySource::default());
        let (svc, _) = service(source);
        let req = SyncRequest::new("SPY", d(1), d(3)).unwrap().with_task_id("t");
        svc.sync(&req).unwrap();

        assert!(svc.progress("t").is_some());
        assert!(svc.clear_progress("t").is_some());
        assert!(svc.progress("t").is_none());
    }

    #[test]
    fn limiter_counts_outbound_calls() {
        let source = Arc::new(DailySource::default());
        let (svc, _) = service(source);
        let req = SyncRequest::new("SPY", d(1), d(3)).unwrap();
        svc.sync(&req).unwrap();
        svc.sync(&req).unwrap();
        // Second call is covered, no acquisition.
        assert_eq!(svc.limiter_stats().total_requests, 1);
    }

    #[test]
    fn config_drives_components() {
        let mut config = SyncConfig::default();
        config.cache.max_size = 7;
        config.sweep.workers = 3;
        let svc = SyncService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DailySource::default()),
            &config,
        );
        assert_eq!(svc.cache().max_size(), 7);
        assert_eq!(svc.workers(), 3);
        assert_eq!(svc.limiter().min_interval(), Duration::from_millis(1000));
    }
}
