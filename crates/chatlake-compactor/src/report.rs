//! Machine-readable run reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use chatlake_core::ContextDate;

use crate::error::{CompactionError, RejectReason};

/// How many skip reasons a report keeps verbatim.
pub const MAX_SKIP_SAMPLES: usize = 10;

/// Terminal outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// A partition file was published.
    Written,
    /// No valid rows; nothing published and any prior file removed.
    SkippedEmpty,
    /// Dry run: rows were flattened and counted, nothing was written.
    DryRun,
    /// The run aborted; the partition is absent or unchanged.
    Failed,
}

impl RunOutcome {
    /// Whether the scheduler should treat the run as successful.
    #[must_use]
    pub fn is_success(self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// Label used for metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::SkippedEmpty => "skipped_empty",
            Self::DryRun => "dry_run",
            Self::Failed => "failed",
        }
    }
}

/// One skipped raw object.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedObject {
    /// Raw object key.
    pub key: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Counters and outcome of one compaction run.
///
/// For every completed run, `rows_written + rows_skipped + duplicates_dropped
/// == objects_seen`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run id (ULID).
    pub run_id: String,
    /// Partition compacted.
    pub context_date: ContextDate,
    /// Terminal outcome.
    pub outcome: RunOutcome,
    /// Raw objects enumerated in the bucket.
    pub objects_seen: u64,
    /// Rows in the published (or, for dry runs, would-be) partition.
    pub rows_written: u64,
    /// Objects rejected as malformed.
    pub rows_skipped: u64,
    /// Rows dropped as duplicate `message_id`s (only when dedupe is enabled).
    pub duplicates_dropped: u64,
    /// Output key, when a file was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    /// Size of the published file in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<u64>,
    /// First few skip reasons.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedObject>,
    /// Error kind when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    /// Error message when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl RunReport {
    /// Creates an empty report for a run that is about to start.
    #[must_use]
    pub fn start(run_id: impl Into<String>, context_date: ContextDate) -> Self {
        Self {
            run_id: run_id.into(),
            context_date,
            outcome: RunOutcome::Failed,
            objects_seen: 0,
            rows_written: 0,
            rows_skipped: 0,
            duplicates_dropped: 0,
            output_key: None,
            output_bytes: None,
            skipped: Vec::new(),
            error_kind: None,
            error: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Records a skipped object, keeping only the first few reasons.
    pub fn record_skip(&mut self, key: &str, reason: &RejectReason) {
        self.rows_skipped += 1;
        if self.skipped.len() < MAX_SKIP_SAMPLES {
            self.skipped.push(SkippedObject {
                key: key.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Marks the run failed. Counters are kept for diagnosis.
    pub fn fail(&mut self, err: &CompactionError) {
        self.outcome = RunOutcome::Failed;
        self.error_kind = Some(err.kind());
        self.error = Some(err.to_string());
        self.output_key = None;
        self.output_bytes = None;
    }

    /// Stamps the duration.
    pub fn finish(&mut self) {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = u64::try_from(elapsed.num_milliseconds()).unwrap_or_default();
    }

    /// Whether the counters add up.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.rows_written + self.rows_skipped + self.duplicates_dropped == self.objects_seen
    }
}
