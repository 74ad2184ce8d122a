//! Structured error types for sync operations.
//!
//! Failures are tagged by where they came from, not by how they are raised:
//! - `SourceError`: the external data source (network, HTTP status, payload)
//! - `StoreError`: the persistent record store
//! - `FetchError`: one fetch-and-persist attempt, either side
//! - `SyncError`: what a sync caller can actually see
//!
//! Source failures never become a `SyncError`. The orchestrator degrades to
//! whatever the store already holds and reports the source error alongside.

use chrono::NaiveDate;
use std::fmt;
use thiserror::Error;

use crate::retry::Retryable;

/// Category of a source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Connection refused, DNS failure, reset.
    Network,
    /// The per-call timeout elapsed.
    Timeout,
    /// HTTP 429 from the source.
    RateLimited,
    /// Any other non-success HTTP status.
    Http(u16),
    /// HTTP 403 or an open circuit breaker. The source is refusing us.
    Blocked,
    /// HTTP 401.
    Unauthorized,
    /// The source does not know the ticker.
    NotFound,
    /// The payload did not have the expected shape.
    ResponseFormat,
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network unreachable"),
            Self::Timeout => write!(f, "timed out"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Http(status) => write!(f, "HTTP {status}"),
            Self::Blocked => write!(f, "blocked by source"),
            Self::Unauthorized => write!(f, "authentication required"),
            Self::NotFound => write!(f, "not found"),
            Self::ResponseFormat => write!(f, "response format changed"),
        }
    }
}

/// A failure reported by the external data source.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Timeout, message)
    }

    pub fn not_found(ticker: &str) -> Self {
        Self::new(SourceErrorKind::NotFound, format!("no data for {ticker}"))
    }

    pub fn response_format(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::ResponseFormat, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Blocked, message)
    }

    /// Network-class failures that are worth another attempt.
    ///
    /// Server-side 5xx counts; everything else the source said on purpose.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            SourceErrorKind::Network | SourceErrorKind::Timeout | SourceErrorKind::RateLimited => {
                true
            }
            SourceErrorKind::Http(status) => (500..600).contains(&status),
            SourceErrorKind::Blocked
            | SourceErrorKind::Unauthorized
            | SourceErrorKind::NotFound
            | SourceErrorKind::ResponseFormat => false,
        }
    }
}

/// A failure of the persistent record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt store data for '{ticker}': {reason}")]
    Corrupt { ticker: String, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Outcome of a failed fetch-and-persist call.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Source(e) => e.is_transient(),
            FetchError::Store(_) => false,
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Errors a sync caller can receive.
///
/// Validation variants are raised before any store or source access.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid ticker '{ticker}': {reason}")]
    InvalidTicker { ticker: String, reason: String },

    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("invalid trailing window: {days} days ending {end}")]
    InvalidWindow { days: u32, end: NaiveDate },

    #[error("ticker list is empty")]
    EmptyTickerList,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// True for errors caused by the request itself rather than the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidTicker { .. }
                | SyncError::InvalidRange { .. }
                | SyncError::InvalidWindow { .. }
                | SyncError::EmptyTickerList
        )
    }
}
