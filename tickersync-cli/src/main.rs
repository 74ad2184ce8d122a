//! tickersync CLI: sync, sweep, and coverage commands.
//!
//! Commands:
//! - `sync`: bring tickers up to date over a window and report the result
//! - `sweep`: sync the configured tickers' trailing window, once or on a timer
//! - `coverage`: print the stored date range per ticker
//! - `config`: print the effective configuration as TOML

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tickersync_core::{SweepSummary, SyncConfig, SyncRequest, SyncService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tickersync",
    about = "tickersync: gap-aware daily market data sync"
)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Make sure the store covers a window for each ticker, fetching gaps.
    Sync {
        /// Tickers to sync (e.g., SPY QQQ AAPL).
        #[arg(required = true)]
        tickers: Vec<String>,

        /// Start date (YYYY-MM-DD). Conflicts with --days.
        #[arg(long, conflicts_with = "days")]
        start: Option<String>,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Trailing window in days ending at --end. Defaults to sweep.days.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Sync the configured tickers' trailing window.
    Sweep {
        /// Seconds between passes. Defaults to sweep.interval_secs.
        #[arg(long, conflicts_with = "once")]
        every: Option<u64>,

        /// Run a single pass and exit.
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Print each pass summary as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the stored date range for each ticker.
    Coverage {
        /// Tickers to report. Defaults to every stored ticker.
        tickers: Vec<String>,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Commands::Sync {
            tickers,
            start,
            end,
            days,
        } => run_sync(&config, &tickers, start, end, days),
        Commands::Sweep { every, once, json } => run_sweep(&config, every, once, json),
        Commands::Coverage { tickers } => run_coverage(&config, tickers),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{value}', expected YYYY-MM-DD"))
}

fn run_sync(
    config: &SyncConfig,
    tickers: &[String],
    start: Option<String>,
    end: Option<String>,
    days: Option<u32>,
) -> Result<()> {
    let end_date = end
        .as_deref()
        .map(parse_date)
        .transpose()?
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let start_date = start.as_deref().map(parse_date).transpose()?;
    let days = days.unwrap_or(config.sweep.days);

    // Validate everything before the first outbound call.
    let requests = tickers
        .iter()
        .map(|t| match start_date {
            Some(s) => SyncRequest::new(t, s, end_date),
            None => SyncRequest::trailing(t, end_date, days),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let service = SyncService::open(config)?;

    println!(
        "{:<10} {:<25} {:>6} {:>8}  Status",
        "Ticker", "Window", "Rows", "Fetched"
    );
    println!("{}", "-".repeat(62));

    let mut failed = Vec::new();
    for req in &requests {
        match service.sync(req) {
            Ok(outcome) => {
                let status = match &outcome.source_error {
                    Some(e) => format!("degraded ({e})"),
                    None => "ok".to_string(),
                };
                println!(
                    "{:<10} {:<25} {:>6} {:>8}  {status}",
                    outcome.ticker,
                    format!("{} to {}", req.start, req.end),
                    outcome.records.len(),
                    outcome.fetched.unwrap_or(0),
                );
            }
            Err(e) => {
                println!("{:<10} {:<25} {:>6} {:>8}  error", req.ticker, "", "-", "-");
                failed.push((req.ticker.clone(), e));
            }
        }
    }

    let stats = service.limiter_stats();
    println!();
    println!(
        "Outbound calls: {} (avg wait {:.2}s)",
        stats.total_requests, stats.avg_wait_secs
    );

    if !failed.is_empty() {
        for (ticker, err) in &failed {
            eprintln!("Error for {ticker}: {err}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_sweep(config: &SyncConfig, every: Option<u64>, once: bool, json: bool) -> Result<()> {
    if config.sweep.tickers.is_empty() {
        bail!("no tickers configured under [sweep]");
    }
    let service = SyncService::open(config)?;
    let interval = Duration::from_secs(every.unwrap_or(config.sweep.interval_secs));

    loop {
        let summary = service.sweep(&config.sweep.tickers, config.sweep.days)?;
        if json {
            println!("{}", serde_json::to_string(&summary)?);
        } else {
            print_sweep_summary(&summary);
        }

        if once {
            if summary.failed > 0 {
                std::process::exit(1);
            }
            return Ok(());
        }
        info!(interval_secs = interval.as_secs(), "waiting for next sweep");
        std::thread::sleep(interval);
    }
}

fn print_sweep_summary(summary: &SweepSummary) {
    println!();
    println!("=== Sweep ===");
    println!("Tickers:   {}", summary.total);
    println!("Synced:    {}", summary.synced);
    println!("Degraded:  {}", summary.degraded);
    println!("Failed:    {}", summary.failed);
    println!("New rows:  {}", summary.fetched_rows);
    for (ticker, message) in &summary.errors {
        println!("WARNING: {ticker}: {message}");
    }
}

fn run_coverage(config: &SyncConfig, tickers: Vec<String>) -> Result<()> {
    let service = SyncService::open(config)?;
    let tickers = if tickers.is_empty() {
        service.store().tickers()?
    } else {
        tickers
    };

    if tickers.is_empty() {
        println!("Store is empty: {}", config.store.dir.display());
        return Ok(());
    }

    println!("Store: {}", config.store.dir.display());
    println!();
    println!("{:<10} {:<25} {:>8}", "Ticker", "Date Range", "Rows");
    println!("{}", "-".repeat(45));
    for ticker in &tickers {
        match service.coverage(ticker)? {
            Some(range) => println!(
                "{:<10} {:<25} {:>8}",
                range.ticker,
                format!("{} to {}", range.min_date, range.max_date),
                range.count
            ),
            None => println!("{:<10} {:<25} {:>8}", ticker, "(no data)", 0),
        }
    }
    Ok(())
}
