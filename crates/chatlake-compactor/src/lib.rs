//! # chatlake-compactor
//!
//! Daily compaction of raw chat message events into one Parquet file per date.
//!
//! A run for `context_date=D`:
//!
//! 1. takes the partition lease for `D`
//! 2. lists the raw bucket for `D`
//! 3. reads and flattens every object through [`flatten::FLATTEN_RULES`],
//!    skipping and counting malformed ones
//! 4. sorts the rows and encodes them as a single Parquet file
//! 5. publishes the file with one put (or, with no valid rows, removes any
//!    previous file)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatlake_compactor::{Compactor, CompactorConfig};
//! use chatlake_core::{ContextDate, LocalFsBackend, StorageBackend};
//!
//! # async fn demo() -> chatlake_compactor::Result<()> {
//! let storage: Arc<dyn StorageBackend> = Arc::new(LocalFsBackend::new("/data/lake"));
//! let compactor = Compactor::new(storage.clone(), storage, CompactorConfig::default())?;
//! let report = compactor.compact(ContextDate::yesterday()).await?;
//! println!("wrote {} rows", report.rows_written);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]

pub mod compactor;
pub mod config;
pub mod error;
pub mod flatten;
pub mod metrics;
pub mod parquet_util;
pub mod publish;
pub mod report;

pub use compactor::{ColumnSummary, Compactor, PartitionSummary};
pub use config::CompactorConfig;
pub use error::{CompactionError, RejectReason, Result};
pub use flatten::{FLATTEN_RULES, FlattenedRow, flatten_bytes};
pub use report::{RunOutcome, RunReport};
