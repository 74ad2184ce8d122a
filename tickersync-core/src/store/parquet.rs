//! Parquet-backed record store with Hive-style partitioning.
//!
//! Layout: `{dir}/ticker={TICKER}/{year}.parquet` plus `meta.json`.
//!
//! - Upserts merge into the existing year partition by date
//! - Writes are atomic (write to .tmp, rename into place)
//! - Corrupt partitions are quarantined (`{file}.quarantined`), not fatal
//! - `meta.json` caches the covered range so coverage checks skip Parquet I/O;
//!   it is trusted only while the partition files still match it

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use super::RecordStore;
use crate::error::StoreError;
use crate::record::{DailyBar, DataRange};

/// Metadata sidecar for a stored ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub ticker: String,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub row_count: usize,
    pub data_hash: String,
    pub written_at: chrono::DateTime<chrono::Utc>,
    /// Byte length of each year partition when the sidecar was written.
    #[serde(default)]
    pub partitions: BTreeMap<i32, u64>,
}

impl StoreMeta {
    fn range(&self) -> DataRange {
        DataRange {
            ticker: self.ticker.clone(),
            min_date: self.min_date,
            max_date: self.max_date,
            count: self.row_count,
        }
    }
}

pub struct ParquetStore {
    dir: PathBuf,
    // Serializes read-modify-write of partitions within this process.
    write_lock: Mutex<()>,
}

impl ParquetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ticker_dir(&self, ticker: &str) -> PathBuf {
        self.dir.join(format!("ticker={ticker}"))
    }

    fn year_path(&self, ticker: &str, year: i32) -> PathBuf {
        self.ticker_dir(ticker).join(format!("{year}.parquet"))
    }

    fn meta_path(&self, ticker: &str) -> PathBuf {
        self.ticker_dir(ticker).join("meta.json")
    }

    /// Read the sidecar for `ticker`, if present and parseable.
    pub fn meta(&self, ticker: &str) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(ticker)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// All rows for `ticker`, ascending. Corrupt partitions are quarantined.
    pub fn load_all(&self, ticker: &str) -> Result<Vec<DailyBar>, StoreError> {
        let dir = self.ticker_dir(ticker);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut all = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            all.extend(self.load_partition(ticker, &path));
        }
        all.sort_by_key(|b| b.date);
        Ok(all)
    }

    /// Load one partition, quarantining it on failure.
    ///
    /// A quarantine also drops the sidecar: its range no longer matches the
    /// partitions, and `range()` rebuilds coverage from what is left.
    fn load_partition(&self, ticker: &str, path: &Path) -> Vec<DailyBar> {
        match load_and_validate_parquet(path) {
            Ok(bars) => bars,
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    ticker,
                    path = %path.display(),
                    error = %e,
                    "quarantining corrupt partition"
                );
                let _ = fs::rename(path, &quarantine);
                let meta_path = self.meta_path(ticker);
                if meta_path.exists() {
                    if let Err(e) = fs::remove_file(&meta_path) {
                        warn!(ticker, error = %e, "failed to drop stale sidecar");
                    }
                }
                Vec::new()
            }
        }
    }

    /// Year -> byte length for every partition file of `ticker`.
    fn partition_sizes(&self, ticker: &str) -> Result<BTreeMap<i32, u64>, StoreError> {
        let dir = self.ticker_dir(ticker);
        let mut sizes = BTreeMap::new();
        if !dir.exists() {
            return Ok(sizes);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            let year = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok());
            if let Some(year) = year {
                sizes.insert(year, entry.metadata()?.len());
            }
        }
        Ok(sizes)
    }

    fn write_meta(&self, ticker: &str, bars: &[DailyBar]) -> Result<(), StoreError> {
        let meta_path = self.meta_path(ticker);
        let Some(range) = DataRange::from_bars(ticker, bars) else {
            if meta_path.exists() {
                fs::remove_file(&meta_path)?;
            }
            return Ok(());
        };

        let payload =
            serde_json::to_vec(bars).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let meta = StoreMeta {
            ticker: ticker.to_string(),
            min_date: range.min_date,
            max_date: range.max_date,
            row_count: range.count,
            data_hash: blake3::hash(&payload).to_hex().to_string(),
            written_at: chrono::Utc::now(),
            partitions: self.partition_sizes(ticker)?,
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = meta_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &meta_path)?;
        Ok(())
    }
}

impl RecordStore for ParquetStore {
    fn range(&self, ticker: &str) -> Result<Option<DataRange>, StoreError> {
        if let Some(meta) = self.meta(ticker) {
            if meta.partitions == self.partition_sizes(ticker)? {
                return Ok(Some(meta.range()));
            }
            debug!(ticker, "sidecar out of date, rebuilding from partitions");
        }
        // Sidecar missing, unreadable or stale: rebuild from the partitions.
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let bars = self.load_all(ticker)?;
        self.write_meta(ticker, &bars)?;
        Ok(DataRange::from_bars(ticker, &bars))
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
        let mut out = Vec::new();
        for year in start.year()..=end.year() {
            let path = self.year_path(ticker, year);
            if !path.exists() {
                continue;
            }
            out.extend(
                self.load_partition(ticker, &path)
                    .into_iter()
                    .filter(|b| b.date >= start && b.date <= end),
            );
        }
        out.sort_by_key(|b| b.date);
        Ok(out)
    }

    fn upsert(&self, ticker: &str, bars: &[DailyBar]) -> Result<usize, StoreError> {
        if bars.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(self.ticker_dir(ticker))?;

        let mut by_year: HashMap<i32, Vec<&DailyBar>> = HashMap::new();
        for bar in bars {
            by_year.entry(bar.date.year()).or_default().push(bar);
        }

        let mut inserted = 0;
        for (year, incoming) in by_year {
            let path = self.year_path(ticker, year);
            let mut merged: BTreeMap<NaiveDate, DailyBar> = if path.exists() {
                self.load_partition(ticker, &path)
                    .into_iter()
                    .map(|b| (b.date, b))
                    .collect()
            } else {
                BTreeMap::new()
            };

            for bar in incoming {
                if merged.insert(bar.date, bar.clone()).is_none() {
                    inserted += 1;
                }
            }

            let rows: Vec<&DailyBar> = merged.values().collect();
            let mut df = bars_to_dataframe(&rows)?;
            let tmp_path = path.with_extension("parquet.tmp");
            write_parquet(&mut df, &tmp_path)?;
            fs::rename(&tmp_path, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                StoreError::Io(format!("atomic rename failed: {e}"))
            })?;
        }

        let all = self.load_all(ticker)?;
        self.write_meta(ticker, &all)?;
        debug!(ticker, inserted, total = all.len(), "parquet upsert complete");
        Ok(inserted)
    }

    fn tickers(&self) -> Result<Vec<String>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut tickers = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(ticker) = name.strip_prefix("ticker=") {
                tickers.push(ticker.to_string());
            }
        }
        tickers.sort();
        Ok(tickers)
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

const COLUMNS: [&str; 7] = ["date", "open", "high", "low", "close", "volume", "adj_close"];

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn bars_to_dataframe(bars: &[&DailyBar]) -> Result<DataFrame, StoreError> {
    let epoch = epoch();
    let dates: Vec<i32> = bars
        .iter()
        .map(|b| (b.date - epoch).num_days() as i32)
        .collect();

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| StoreError::Parquet(format!("date cast: {e}")))?,
        Column::new("open".into(), bars.iter().map(|b| b.open).collect::<Vec<f64>>()),
        Column::new("high".into(), bars.iter().map(|b| b.high).collect::<Vec<f64>>()),
        Column::new("low".into(), bars.iter().map(|b| b.low).collect::<Vec<f64>>()),
        Column::new("close".into(), bars.iter().map(|b| b.close).collect::<Vec<f64>>()),
        Column::new("volume".into(), bars.iter().map(|b| b.volume).collect::<Vec<u64>>()),
        Column::new(
            "adj_close".into(),
            bars.iter().map(|b| b.adj_close).collect::<Vec<f64>>(),
        ),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), StoreError> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

fn load_and_validate_parquet(path: &Path) -> Result<Vec<DailyBar>, StoreError> {
    let file = fs::File::open(path)?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(StoreError::Parquet("empty partition".into()));
    }
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(StoreError::Parquet(format!("missing column '{name}'")));
        }
    }
    dataframe_to_bars(&df)
}

fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<DailyBar>, StoreError> {
    let col = |name: &str| {
        df.column(name)
            .map_err(|e| StoreError::Parquet(format!("column {name}: {e}")))
    };
    let typed =
        |name: &str, e: PolarsError| StoreError::Parquet(format!("{name} column type: {e}"));

    let date_ca = col("date")?.date().map_err(|e| typed("date", e))?;
    let open_ca = col("open")?.f64().map_err(|e| typed("open", e))?;
    let high_ca = col("high")?.f64().map_err(|e| typed("high", e))?;
    let low_ca = col("low")?.f64().map_err(|e| typed("low", e))?;
    let close_ca = col("close")?.f64().map_err(|e| typed("close", e))?;
    let vol_ca = col("volume")?.u64().map_err(|e| typed("volume", e))?;
    let adj_ca = col("adj_close")?.f64().map_err(|e| typed("adj_close", e))?;

    let epoch = epoch();
    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let days = date_ca
            .get(i)
            .ok_or_else(|| StoreError::Parquet(format!("null date at row {i}")))?;
        bars.push(DailyBar {
            date: epoch + chrono::Duration::days(days as i64),
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            volume: vol_ca.get(i).unwrap_or(0),
            adj_close: adj_ca.get(i).unwrap_or(f64::NAN),
        });
    }
    Ok(bars)
}
