//! Persistent record store, keyed by ticker + date.
//!
//! The orchestrator only needs three things from persistence: the covered
//! range for a ticker, the rows inside a window, and an idempotent upsert.

pub mod memory;
pub mod parquet;

pub use memory::MemoryStore;
pub use parquet::{ParquetStore, StoreMeta};

use chrono::NaiveDate;

use crate::error::StoreError;
use crate::record::{DailyBar, DataRange};

/// Storage backend for daily records.
pub trait RecordStore: Send + Sync {
    /// Covered range for `ticker`, or `None` when nothing is stored.
    fn range(&self, ticker: &str) -> Result<Option<DataRange>, StoreError>;

    /// Rows in `[start, end]`, ascending by date.
    fn read(&self, ticker: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<DailyBar>, StoreError>;

    /// Insert or replace rows by date. Returns how many dates were new.
    fn upsert(&self, ticker: &str, bars: &[DailyBar]) -> Result<usize, StoreError>;

    /// Tickers with at least one stored row, sorted.
    fn tickers(&self) -> Result<Vec<String>, StoreError>;
}
