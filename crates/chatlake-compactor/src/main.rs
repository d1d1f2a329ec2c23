//! `chatlake-compactor` command-line entry point.
//!
//! ## Usage
//!
//! ```bash
//! # Compact yesterday's bucket
//! chatlake-compactor --raw-root /data/raw --output-root /data/lake compact
//!
//! # Compact a given date without writing
//! chatlake-compactor compact --date 2025-10-29 --dry-run
//!
//! # Re-run a range of dates
//! chatlake-compactor backfill --from 2025-10-01 --to 2025-10-29
//!
//! # Show what is published for a date
//! chatlake-compactor inspect --date 2025-10-29
//! ```
//!
//! Reports go to stdout as JSON, one line per run. Logs go to stderr.
//!
//! Tunables come from `CHATLAKE_*` environment variables (see
//! [`CompactorConfig::from_env_unvalidated`]); the flags below override them.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use chatlake_compactor::metrics::init_metrics;
use chatlake_compactor::{Compactor, CompactorConfig, RunReport};
use metrics_exporter_prometheus::PrometheusHandle;
use chatlake_core::{ContextDate, LocalFsBackend, LogFormat, StorageBackend, init_logging};

/// Compacts raw chat message events into daily Parquet partitions.
#[derive(Debug, Parser)]
#[command(name = "chatlake-compactor")]
#[command(about = "Compacts raw chat message events into daily Parquet partitions")]
#[command(version)]
struct Args {
    /// Local directory holding the raw event store.
    #[arg(long, env = "CHATLAKE_RAW_ROOT", global = true, default_value = ".")]
    raw_root: PathBuf,

    /// Local directory holding the compacted store. Defaults to the raw root.
    #[arg(long, env = "CHATLAKE_OUTPUT_ROOT", global = true)]
    output_root: Option<PathBuf>,

    /// Prefix of the raw event buckets.
    #[arg(long, global = true)]
    raw_prefix: Option<String>,

    /// Prefix of the compacted partitions.
    #[arg(long, global = true)]
    output_prefix: Option<String>,

    /// Maximum concurrent object reads.
    #[arg(long, global = true)]
    read_concurrency: Option<usize>,

    /// Timeout for each storage call, in seconds.
    #[arg(long, global = true)]
    io_timeout_secs: Option<u64>,

    /// Budget for a whole run, in seconds.
    #[arg(long, global = true)]
    run_timeout_secs: Option<u64>,

    /// Partition lease TTL, in seconds.
    #[arg(long, global = true)]
    lease_ttl_secs: Option<u64>,

    /// Drop rows repeating a `message_id` already seen in the bucket.
    #[arg(long, global = true)]
    dedupe: bool,

    /// Write Prometheus metrics for the invocation to this file on exit.
    #[arg(long, env = "CHATLAKE_METRICS_FILE", global = true)]
    metrics_file: Option<PathBuf>,

    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "CHATLAKE_LOG_FORMAT", global = true, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compact one date bucket.
    Compact {
        /// Date to compact (YYYY-MM-DD). Defaults to yesterday (UTC).
        #[arg(long)]
        date: Option<ContextDate>,

        /// Read and flatten only; write nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Compact every date in an inclusive range, stopping at the first failure.
    Backfill {
        /// First date (inclusive).
        #[arg(long)]
        from: ContextDate,

        /// Last date (inclusive).
        #[arg(long)]
        to: ContextDate,

        /// Read and flatten only; write nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the row count and schema of a published partition.
    Inspect {
        /// Partition date (YYYY-MM-DD).
        #[arg(long)]
        date: ContextDate,
    },
}

impl Args {
    /// Environment config with command-line overrides applied, validated once.
    fn config(&self) -> Result<CompactorConfig> {
        let env = CompactorConfig::from_env_unvalidated().context("invalid CHATLAKE_* environment")?;
        self.layer(env)
    }

    fn layer(&self, mut config: CompactorConfig) -> Result<CompactorConfig> {
        if let Some(prefix) = &self.raw_prefix {
            config.raw_prefix.clone_from(prefix);
        }
        if let Some(prefix) = &self.output_prefix {
            config.output_prefix.clone_from(prefix);
        }
        if let Some(n) = self.read_concurrency {
            config.read_concurrency = n;
        }
        if let Some(secs) = self.io_timeout_secs {
            config.io_timeout_secs = secs;
        }
        if let Some(secs) = self.run_timeout_secs {
            config.run_timeout_secs = secs;
        }
        if let Some(secs) = self.lease_ttl_secs {
            config.lease_ttl_secs = secs;
        }
        if self.dedupe {
            config.dedupe = true;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn compactor(&self) -> Result<Compactor> {
        let raw: Arc<dyn StorageBackend> = Arc::new(LocalFsBackend::new(&self.raw_root));
        let output: Arc<dyn StorageBackend> = match &self.output_root {
            Some(root) if root != &self.raw_root => Arc::new(LocalFsBackend::new(root)),
            _ => raw.clone(),
        };
        Ok(Compactor::new(raw, output, self.config()?)?)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value).context("serialize output")?);
    Ok(())
}

fn write_metrics(path: &Path, handle: &PrometheusHandle) -> Result<()> {
    std::fs::write(path, handle.render())
        .with_context(|| format!("write metrics to {}", path.display()))
}

fn exit_code(reports: &[RunReport]) -> ExitCode {
    if reports.iter().all(|r| r.outcome.is_success()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.log_format);

    let compactor = args.compactor()?;
    tracing::info!(config = ?compactor.config(), "compactor configured");
    let metrics = match &args.metrics_file {
        Some(path) => Some((path.clone(), init_metrics()?)),
        None => None,
    };

    let code = run(&compactor, args.command).await?;

    if let Some((path, handle)) = metrics {
        write_metrics(&path, &handle)?;
    }
    Ok(code)
}

async fn run(compactor: &Compactor, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Compact { date, dry_run } => {
            let date = date.unwrap_or_else(ContextDate::yesterday);
            let report = compactor.run(date, dry_run).await;
            print_json(&report)?;
            Ok(exit_code(std::slice::from_ref(&report)))
        }
        Commands::Backfill { from, to, dry_run } => {
            let reports = compactor.backfill(from, to, dry_run).await?;
            for report in &reports {
                print_json(report)?;
            }
            Ok(exit_code(&reports))
        }
        Commands::Inspect { date } => match compactor.inspect(date).await? {
            Some(summary) => {
                print_json(&summary)?;
                Ok(ExitCode::SUCCESS)
            }
            None => {
                tracing::warn!(context_date = %date, "no partition published");
                Ok(ExitCode::FAILURE)
            }
        },
    }
}
