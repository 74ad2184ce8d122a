//! tickersync core: resilient, gap-aware ticker data sync.
//!
//! Building blocks:
//! - `TtlCache` with creation-order eviction and substring invalidation
//! - `RateLimiter` gating every outbound call (min interval + concurrency cap)
//! - `RetryPolicy` with exponential backoff over `Retryable` errors
//! - `SyncOrchestrator`, the single read-with-possible-fetch choke point
//! - `ProgressStore` for polling long-running tasks
//!
//! `SyncService` wires them to a `RecordStore` and a `Source`.

pub mod cache_key;
pub mod config;
pub mod error;
pub mod progress;
pub mod rate_limit;
pub mod record;
pub mod retry;
pub mod service;
pub mod source;
pub mod store;
pub mod sweep;
pub mod sync;
pub mod ttl_cache;

pub use cache_key::cache_key;
pub use config::{ConfigError, SyncConfig};
pub use error::{FetchError, SourceError, SourceErrorKind, StoreError, SyncError};
pub use progress::{ProgressStore, SyncPhase, SyncProgress};
pub use rate_limit::{RateLimiter, RateLimiterStats, RatePermit};
pub use record::{DailyBar, DataRange, FetchRequest, SyncRequest};
pub use retry::{RetryPolicy, Retryable};
pub use service::{BarsAnswer, SyncService};
pub use source::{fetch_and_persist, Source};
pub use store::{MemoryStore, ParquetStore, RecordStore};
pub use sweep::SweepSummary;
pub use sync::{FetchPlan, SyncOrchestrator, SyncOutcome};
pub use ttl_cache::{CacheStats, TtlCache};
