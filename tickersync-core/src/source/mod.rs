//! External data sources.
//!
//! A [`Source`] makes exactly one outbound call per `fetch`. Rate limiting
//! and retries are applied by the orchestrator around it, so every caller
//! gets the same protection.

pub mod breaker;
pub mod yahoo;

pub use breaker::{BreakerState, SourceBreaker};
pub use yahoo::YahooSource;

use chrono::NaiveDate;
use tracing::info;

use crate::error::{FetchError, SourceError};
use crate::record::{DailyBar, FetchRequest};
use crate::store::RecordStore;

/// A provider of daily records (Yahoo Finance, a fixture, a mock).
pub trait Source: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// One outbound call for `ticker` over `[start, end]`.
    fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, SourceError>;
}

/// Pull `request` from `source` and upsert it into `store`.
///
/// Returns the number of newly stored rows. An empty payload is not an
/// error: the source simply has nothing for that window.
pub fn fetch_and_persist(
    source: &dyn Source,
    store: &dyn RecordStore,
    request: &FetchRequest,
) -> Result<usize, FetchError> {
    let bars = source.fetch(&request.ticker, request.start, request.end)?;
    let received = bars.len();
    let inserted = store.upsert(&request.ticker, &bars)?;
    info!(
        ticker = %request.ticker,
        source = source.name(),
        fetch_days = request.fetch_days,
        received,
        inserted,
        "fetched and persisted"
    );
    Ok(inserted)
}
