//! In-process store for tests and throwaway runs.

use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use super::RecordStore;
use crate::error::StoreError;
use crate::record::{DailyBar, DataRange};

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, BTreeMap<NaiveDate, DailyBar>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across all tickers.
    pub fn row_count(&self) -> usize {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.values().map(|r| r.len()).sum()
    }
}

impl RecordStore for MemoryStore {
    fn range(&self, ticker: &str) -> Result<Option<DataRange>, StoreError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let Some(by_date) = rows.get(ticker) else {
            return Ok(None);
        };
        let (Some((&min_date, _)), Some((&max_date, _))) =
            (by_date.first_key_value(), by_date.last_key_value())
        else {
            return Ok(None);
        };
        Ok(Some(DataRange {
            ticker: ticker.to_string(),
            min_date,
            max_date,
            count: by_date.len(),
        }))
    }

    fn read(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get(ticker)
            .map(|by_date| by_date.range(start..=end).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    fn upsert(&self, ticker: &str, bars: &[DailyBar]) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let by_date = rows.entry(ticker.to_string()).or_default();
        let mut inserted = 0;
        for bar in bars {
            if by_date.insert(bar.date, bar.clone()).is_none() {
                inserted += 1;
            }
        }
        if by_date.is_empty() {
            rows.remove(ticker);
        }
        Ok(inserted)
    }

    fn tickers(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut tickers: Vec<String> = rows.keys().cloned().collect();
        tickers.sort();
        Ok(tickers)
    }
}
