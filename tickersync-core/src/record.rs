//! Records, coverage ranges, and validated requests.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Longest ticker accepted by [`SyncRequest`].
pub const MAX_TICKER_LEN: usize = 16;

/// One persisted daily row for a ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub adj_close: f64,
}

impl DailyBar {
    /// A flat bar (open = high = low = close). Handy for fixtures.
    pub fn flat(date: NaiveDate, price: f64, volume: u64) -> Self {
        Self {
            date,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            adj_close: price,
        }
    }
}

/// What the store already holds for one ticker.
///
/// Derived on every coverage check, never stored. "No rows" is `None`
/// at the call site, not an empty range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRange {
    pub ticker: String,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub count: usize,
}

impl DataRange {
    /// Build a range from bars in any order. `None` when `bars` is empty.
    pub fn from_bars(ticker: &str, bars: &[DailyBar]) -> Option<Self> {
        let min_date = bars.iter().map(|b| b.date).min()?;
        let max_date = bars.iter().map(|b| b.date).max()?;
        Some(Self {
            ticker: ticker.to_string(),
            min_date,
            max_date,
            count: bars.len(),
        })
    }

    pub fn covers(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.min_date <= start && self.max_date >= end
    }
}

/// Inclusive day count of `[start, end]`.
pub fn span_days(start: NaiveDate, end: NaiveDate) -> u32 {
    let days = (end - start).num_days() + 1;
    days.clamp(0, u32::MAX as i64) as u32
}

/// Normalize and validate a ticker symbol.
pub fn normalize_ticker(raw: &str) -> Result<String, SyncError> {
    let ticker = raw.trim().to_ascii_uppercase();
    let invalid = |reason: &str| SyncError::InvalidTicker {
        ticker: raw.to_string(),
        reason: reason.to_string(),
    };

    if ticker.is_empty() {
        return Err(invalid("empty"));
    }
    if ticker.len() > MAX_TICKER_LEN {
        return Err(invalid("too long"));
    }
    if let Some(c) = ticker
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '=')))
    {
        return Err(invalid(&format!("unexpected character '{c}'")));
    }
    Ok(ticker)
}

/// A validated read-with-possible-fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub ticker: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Publish progress under this id while the request runs.
    pub task_id: Option<String>,
}

impl SyncRequest {
    pub fn new(ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Self, SyncError> {
        let ticker = normalize_ticker(ticker)?;
        if start > end {
            return Err(SyncError::InvalidRange { start, end });
        }
        Ok(Self {
            ticker,
            start,
            end,
            task_id: None,
        })
    }

    /// The `days` most recent days ending at `end`, inclusive.
    ///
    /// Zero days, or a window reaching past the earliest representable
    /// date, is rejected.
    pub fn trailing(ticker: &str, end: NaiveDate, days: u32) -> Result<Self, SyncError> {
        let invalid = || SyncError::InvalidWindow { days, end };
        if days == 0 {
            return Err(invalid());
        }
        let back = chrono::Duration::try_days(i64::from(days) - 1).ok_or_else(invalid)?;
        let start = end.checked_sub_signed(back).ok_or_else(invalid)?;
        Self::new(ticker, start, end)
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn span_days(&self) -> u32 {
        span_days(self.start, self.end)
    }
}

/// What the orchestrator hands the fetch collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub ticker: String,
    /// Always the full requested span, never only the uncovered edge.
    pub fetch_days: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}
