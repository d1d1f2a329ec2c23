//! Error types for compaction runs.
//!
//! Run-level errors abort the run before anything is published. Row-level
//! problems are [`RejectReason`]s: they are counted and never surface here.

use std::future::Future;
use std::time::Duration;

use chatlake_core::{ContextDate, LeaseError};
use thiserror::Error;
use tokio::time::Instant;

/// Result type alias for compaction operations.
pub type Result<T> = std::result::Result<T, CompactionError>;

/// Fatal errors for a single compaction run.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Listing or reading the raw event store failed.
    #[error("raw store unavailable: {message}")]
    StoreUnavailable {
        /// What was being attempted.
        message: String,
        /// The underlying storage error.
        #[source]
        source: Option<chatlake_core::Error>,
    },

    /// Publishing (or clearing) the compacted partition failed.
    #[error("write failure for {key}: {message}")]
    WriteFailure {
        /// Output object key.
        key: String,
        /// Description of the failure.
        message: String,
    },

    /// Building the Parquet artifact failed.
    #[error("parquet encode failed: {message}")]
    Encode {
        /// Description of the encoding failure.
        message: String,
    },

    /// Another run holds the lease for this partition.
    #[error("partition {date} is being compacted by {holder}")]
    LeaseHeld {
        /// Partition being compacted.
        date: ContextDate,
        /// Current lease holder.
        holder: String,
    },

    /// The lease was lost before publishing.
    #[error("lease for partition {date} was lost before publish")]
    LeaseLost {
        /// Partition being compacted.
        date: ContextDate,
    },

    /// A storage call or the whole run exceeded its time budget.
    #[error("timed out after {seconds}s: {operation}")]
    Timeout {
        /// What timed out.
        operation: String,
        /// Budget in seconds.
        seconds: u64,
    },

    /// Invalid configuration or arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CompactionError {
    /// Wraps a raw store failure.
    #[must_use]
    pub fn store(message: impl Into<String>, source: chatlake_core::Error) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Converts a lease failure for `date`.
    #[must_use]
    pub fn from_lease(date: ContextDate, err: LeaseError) -> Self {
        match err {
            LeaseError::Held { holder, .. } => Self::LeaseHeld { date, holder },
            LeaseError::Lost { .. } => Self::LeaseLost { date },
            LeaseError::Storage(e) => Self::WriteFailure {
                key: format!("lease for {date}"),
                message: e.to_string(),
            },
        }
    }

    /// Stable machine-readable error kind for run reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::WriteFailure { .. } => "write_failure",
            Self::Encode { .. } => "encode",
            Self::LeaseHeld { .. } => "lease_held",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Timeout { .. } => "timeout",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

/// Runs `fut` under `budget`, mapping expiry to [`CompactionError::Timeout`].
pub(crate) async fn with_timeout<T>(
    operation: impl Into<String>,
    budget: Duration,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| CompactionError::Timeout {
            operation: operation.into(),
            seconds: budget.as_secs(),
        })
}

/// Deadline shared by every budgeted step of one run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunBudget {
    deadline: Instant,
    budget: Duration,
}

impl RunBudget {
    /// Starts the clock.
    pub(crate) fn start(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            budget,
        }
    }

    /// Runs `fut` until the deadline, mapping expiry to [`CompactionError::Timeout`].
    pub(crate) async fn run<T>(
        &self,
        operation: impl Into<String>,
        fut: impl Future<Output = T>,
    ) -> Result<T> {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| CompactionError::Timeout {
                operation: operation.into(),
                seconds: self.budget.as_secs(),
            })
    }
}

/// Why a single raw object did not produce a row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// The object is not valid UTF-8 JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// A required field is absent or null.
    #[error("missing required field {field}")]
    Missing {
        /// Target column name.
        field: &'static str,
    },

    /// The source value has the wrong JSON type.
    #[error("field {field}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Target column name.
        field: &'static str,
        /// Expected source type.
        expected: &'static str,
        /// JSON type actually found.
        found: &'static str,
    },

    /// The value has the right type but cannot be represented without loss.
    #[error("field {field}: cannot coerce {value}")]
    Uncoercible {
        /// Target column name.
        field: &'static str,
        /// Offending value (rendered as JSON).
        value: String,
    },
}
