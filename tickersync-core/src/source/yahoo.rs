//! Yahoo Finance daily chart source.
//!
//! One HTTP request per `fetch`, with a fixed per-call timeout. Retries and
//! throttling happen in the orchestrator; this type only maps the response
//! (or the failure) onto `DailyBar`s / `SourceError`s and keeps the circuit
//! breaker informed.
//!
//! Yahoo has no official API and changes its payload without notice, so a
//! parse failure is reported as `ResponseFormat`, never retried.

use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::breaker::SourceBreaker;
use super::Source;
use crate::error::{SourceError, SourceErrorKind};
use crate::record::DailyBar;

pub const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

pub struct YahooSource {
    client: reqwest::blocking::Client,
    breaker: Arc<SourceBreaker>,
    base_url: String,
}

impl YahooSource {
    pub fn new(
        breaker: Arc<SourceBreaker>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| SourceError::network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            breaker,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point at a different host (a proxy or a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn breaker(&self) -> &SourceBreaker {
        &self.breaker
    }

    fn chart_url(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(start_ts);
        format!(
            "{}/v8/finance/chart/{ticker}\
             ?period1={start_ts}&period2={end_ts}&interval=1d\
             &includeAdjustedClose=true",
            self.base_url
        )
    }

    fn send(&self, ticker: &str, url: &str) -> Result<Vec<DailyBar>, SourceError> {
        let resp = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                SourceError::timeout(format!("{ticker}: {e}"))
            } else {
                SourceError::network(format!("{ticker}: {e}"))
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            self.breaker.trip();
            return Err(SourceError::blocked(format!("HTTP 403 for {ticker}")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unspecified")
                .to_string();
            return Err(SourceError::new(
                SourceErrorKind::RateLimited,
                format!("HTTP 429 for {ticker} (retry-after: {retry_after})"),
            ));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SourceError::new(
                SourceErrorKind::Unauthorized,
                "Yahoo Finance requires authentication",
            ));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::not_found(ticker));
        }
        if !status.is_success() {
            return Err(SourceError::new(
                SourceErrorKind::Http(status.as_u16()),
                format!("unexpected status for {ticker}"),
            ));
        }

        let chart: ChartResponse = resp
            .json()
            .map_err(|e| SourceError::response_format(format!("{ticker}: {e}")))?;
        parse_chart(ticker, chart)
    }
}

impl Source for YahooSource {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, SourceError> {
        self.breaker.check()?;

        let url = self.chart_url(ticker, start, end);
        debug!(ticker, %url, "requesting chart");

        match self.send(ticker, &url) {
            Ok(bars) => {
                self.breaker.record_success();
                Ok(bars)
            }
            Err(e) => {
                if e.is_transient() {
                    self.breaker.record_failure();
                }
                Err(e)
            }
        }
    }
}

/// Turn a chart payload into bars. Rows with no values at all (holidays) are
/// skipped; an empty window yields an empty vec.
fn parse_chart(ticker: &str, resp: ChartResponse) -> Result<Vec<DailyBar>, SourceError> {
    let Some(result) = resp.chart.result else {
        return Err(match resp.chart.error {
            Some(err) if err.code == "Not Found" => SourceError::not_found(ticker),
            Some(err) => {
                SourceError::response_format(format!("{}: {}", err.code, err.description))
            }
            None => SourceError::response_format("empty result with no error"),
        });
    };

    let data = result
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::response_format("result array is empty"))?;

    // No timestamps means no trading days in the window.
    let Some(timestamps) = data.timestamp else {
        return Ok(Vec::new());
    };

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::response_format("no quote data"))?;

    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| SourceError::response_format(format!("invalid timestamp: {ts}")))?;

        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();
        let adj_close = adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten());

        if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none()
        {
            continue;
        }

        bars.push(DailyBar {
            date,
            open: open.unwrap_or(f64::NAN),
            high: high.unwrap_or(f64::NAN),
            low: low.unwrap_or(f64::NAN),
            close: close.unwrap_or(f64::NAN),
            volume: volume.unwrap_or(0),
            adj_close: adj_close.or(close).unwrap_or(f64::NAN),
        });
    }

    Ok(bars)
}
