//! Periodic sweep: bring the trailing window of many tickers up to date.
//!
//! Tickers run on a private rayon pool sized by `workers`. Each one goes
//! through the same orchestrator path as an interactive sync, so the shared
//! rate limiter still gates every outbound call no matter how many workers
//! are busy. Progress is published under the `sweep` task id.

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::progress::{SyncPhase, SyncProgress};
use crate::record::{DailyBar, SyncRequest};
use crate::service::SyncService;
use crate::sync::SyncOutcome;

type SyncResult = Result<SyncOutcome<Vec<DailyBar>>, SyncError>;

/// Progress task id of the sweep.
pub const SWEEP_TASK_ID: &str = "sweep";

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub total: usize,
    /// Synced with the source answering.
    pub synced: usize,
    /// Source failed; stored data was kept.
    pub degraded: usize,
    /// Store failures.
    pub failed: usize,
    /// Rows newly persisted across all tickers.
    pub fetched_rows: usize,
    /// `(ticker, message)` for every degraded or failed ticker.
    pub errors: Vec<(String, String)>,
}

impl SweepSummary {
    pub fn all_synced(&self) -> bool {
        self.synced == self.total
    }

    fn record(&mut self, ticker: String, result: SyncResult) {
        match result {
            Ok(outcome) => {
                self.fetched_rows += outcome.fetched.unwrap_or(0);
                match outcome.source_error {
                    Some(e) => {
                        self.degraded += 1;
                        self.errors.push((ticker, e.to_string()));
                    }
                    None => self.synced += 1,
                }
            }
            Err(e) => {
                self.failed += 1;
                self.errors.push((ticker, e.to_string()));
            }
        }
    }
}

/// Sweep `tickers` over `[end - days + 1, end]`.
///
/// Every ticker is validated before anything runs; one bad symbol rejects
/// the whole pass.
pub(crate) fn run(
    service: &SyncService,
    tickers: &[String],
    days: u32,
    end: NaiveDate,
) -> Result<SweepSummary, SyncError> {
    if tickers.is_empty() {
        return Err(SyncError::EmptyTickerList);
    }
    let requests = tickers
        .iter()
        .map(|t| SyncRequest::trailing(t, end, days))
        .collect::<Result<Vec<_>, _>>()?;

    let total = requests.len();
    let progress = service.progress_store();
    progress.update(
        SWEEP_TASK_ID,
        SyncProgress::new(SyncPhase::Sweeping, 0, total),
    );
    info!(total, days, %end, workers = service.workers(), "sweep started");

    // Serializes progress writes for the sweep task id.
    let processed = Mutex::new(0usize);
    let sync_one = |req: &SyncRequest| {
        let result = service.sync(req);
        let mut done = processed.lock().unwrap_or_else(PoisonError::into_inner);
        *done += 1;
        progress.update(
            SWEEP_TASK_ID,
            SyncProgress::new(SyncPhase::Sweeping, *done, total).for_ticker(&req.ticker),
        );
        (req.ticker.clone(), result)
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(service.workers())
        .thread_name(|i| format!("tickersync-sweep-{i}"))
        .build();
    let results: Vec<(String, SyncResult)> = match pool {
        Ok(pool) => pool.install(|| requests.par_iter().map(sync_one).collect()),
        Err(e) => {
            warn!(error = %e, "could not build sweep pool, running sequentially");
            requests.iter().map(sync_one).collect()
        }
    };

    let mut summary = SweepSummary {
        total,
        ..SweepSummary::default()
    };
    for (ticker, result) in results {
        summary.record(ticker, result);
    }

    let phase = if summary.failed == 0 {
        SyncPhase::Done
    } else {
        SyncPhase::Failed
    };
    progress.update(
        SWEEP_TASK_ID,
        SyncProgress::new(phase, total, total).with_message(format!(
            "{} synced, {} degraded, {} failed, {} new rows",
            summary.synced, summary.degraded, summary.failed, summary.fetched_rows
        )),
    );
    info!(
        synced = summary.synced,
        degraded = summary.degraded,
        failed = summary.failed,
        fetched_rows = summary.fetched_rows,
        "sweep finished"
    );
    Ok(summary)
}
