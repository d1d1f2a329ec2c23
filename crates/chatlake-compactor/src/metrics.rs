//! Compactor metrics.
//!
//! Emitted through the `metrics` facade. Without an installed recorder the
//! calls are no-ops, so library users pick their own exporter. The binary
//! installs the Prometheus recorder with [`init_metrics`] and writes the
//! rendered exposition to a file for a textfile collector.

use std::sync::{Once, OnceLock};
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::report::RunReport;

/// Completed runs, labelled by outcome.
pub const COMPACTION_RUNS_TOTAL: &str = "compaction_runs_total";

/// Raw objects enumerated.
pub const COMPACTION_OBJECTS_SEEN: &str = "compaction_objects_seen";

/// Rows written to published partitions.
pub const COMPACTION_ROWS_WRITTEN: &str = "compaction_rows_written";

/// Raw objects skipped as malformed.
pub const COMPACTION_ROWS_SKIPPED: &str = "compaction_rows_skipped";

/// Run duration in seconds.
pub const COMPACTION_DURATION: &str = "compaction_duration_seconds";

static DESCRIBE: Once = Once::new();

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and describes the metrics.
///
/// Safe to call multiple times; later calls return the same handle.
///
/// # Errors
///
/// Returns the build error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    tracing::info!("prometheus metrics recorder initialized");
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Registers metric descriptions with the installed recorder.
///
/// Call after installing a recorder; later calls are no-ops.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(COMPACTION_RUNS_TOTAL, "Total compaction runs by outcome");
        describe_counter!(COMPACTION_OBJECTS_SEEN, "Raw objects enumerated by compaction");
        describe_counter!(COMPACTION_ROWS_WRITTEN, "Rows written to compacted partitions");
        describe_counter!(COMPACTION_ROWS_SKIPPED, "Raw objects skipped as malformed");
        describe_histogram!(COMPACTION_DURATION, "Duration of compaction runs in seconds");
    });
}

/// Records a finished run.
pub fn record_run(report: &RunReport, duration_secs: f64) {
    let outcome = report.outcome.as_str();

    counter!(COMPACTION_RUNS_TOTAL, "outcome" => outcome).increment(1);
    counter!(COMPACTION_OBJECTS_SEEN).increment(report.objects_seen);
    counter!(COMPACTION_ROWS_WRITTEN).increment(report.rows_written);
    counter!(COMPACTION_ROWS_SKIPPED).increment(report.rows_skipped);
    histogram!(COMPACTION_DURATION, "outcome" => outcome).record(duration_secs);

    tracing::debug!(
        outcome,
        duration_secs,
        objects_seen = report.objects_seen,
        "recorded compaction metrics"
    );
}

/// Measures one run from start to [`CompactionTimer::finish`].
pub struct CompactionTimer {
    start: Instant,
}

impl CompactionTimer {
    /// Starts timing.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Stops the timer and records the run.
    pub fn finish(self, report: &RunReport) {
        record_run(report, self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RunOutcome;

    #[test]
    fn run_is_rendered_with_outcome_label() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let mut report = RunReport::start("01JB", "2025-10-29".parse().unwrap());
        report.outcome = RunOutcome::Written;
        report.objects_seen = 3;
        report.rows_written = 2;
        report.rows_skipped = 1;
        metrics::with_local_recorder(&recorder, || {
            describe_metrics();
            record_run(&report, 0.25);
        });

        let text = handle.render();
        assert!(text.contains(r#"compaction_runs_total{outcome="written"} 1"#), "{text}");
        assert!(text.contains("compaction_objects_seen 3"), "{text}");
        assert!(text.contains("compaction_rows_skipped 1"), "{text}");
    }
}
