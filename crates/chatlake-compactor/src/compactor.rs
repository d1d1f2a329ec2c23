//! The compaction run: list, flatten, accumulate, publish.
//!
//! A run is a function of `(date, raw store snapshot)`. It holds no state
//! across invocations; everything it learns ends up in the [`RunReport`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use chatlake_core::{
    compaction_span, ContextDate, LeaseGuard, PartitionLease, StorageBackend, StorageLayout,
};

use crate::config::CompactorConfig;
use crate::error::{with_timeout, CompactionError, RejectReason, Result, RunBudget};
use crate::flatten::{flatten_bytes, FlattenedRow};
use crate::metrics::CompactionTimer;
use crate::parquet_util::{read_partition, write_partition};
use crate::publish::PartitionPublisher;
use crate::report::{RunOutcome, RunReport};

/// Compacts one date bucket of raw message events into a Parquet partition.
pub struct Compactor {
    raw: Arc<dyn StorageBackend>,
    output: Arc<dyn StorageBackend>,
    config: CompactorConfig,
    layout: StorageLayout,
    publisher: PartitionPublisher,
}

impl Compactor {
    /// Creates a compactor reading from `raw` and publishing to `output`.
    ///
    /// The two may be the same backend; the layout keeps their prefixes apart.
    ///
    /// # Errors
    ///
    /// Returns [`CompactionError::InvalidInput`] if the configuration is invalid.
    pub fn new(
        raw: Arc<dyn StorageBackend>,
        output: Arc<dyn StorageBackend>,
        config: CompactorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let publisher = PartitionPublisher::new(output.clone(), layout.clone(), config.io_timeout());
        Ok(Self {
            raw,
            output,
            config,
            layout,
            publisher,
        })
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Key layout in effect.
    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Compacts `date`, returning the error that aborted the run if any.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`CompactionError`] of a failed run. Malformed
    /// records never fail a run.
    pub async fn compact(&self, date: ContextDate) -> Result<RunReport> {
        let (report, result) = self.execute(date, false).await;
        result.map(|()| report)
    }

    /// Runs compaction for `date` and always returns a report.
    ///
    /// With `dry_run` the bucket is read and flattened but nothing is written
    /// and no lease is taken.
    pub async fn run(&self, date: ContextDate, dry_run: bool) -> RunReport {
        self.execute(date, dry_run).await.0
    }

    /// Runs each date in `from..=to` in order, stopping after the first failed
    /// run. The failed run's report is the last element.
    ///
    /// # Errors
    ///
    /// Returns [`CompactionError::InvalidInput`] if `from` is after `to`.
    pub async fn backfill(
        &self,
        from: ContextDate,
        to: ContextDate,
        dry_run: bool,
    ) -> Result<Vec<RunReport>> {
        if from > to {
            return Err(CompactionError::InvalidInput(format!(
                "backfill range is empty: {from} is after {to}"
            )));
        }

        let mut reports = Vec::new();
        for date in from.through(to) {
            let report = self.run(date, dry_run).await;
            let failed = !report.outcome.is_success();
            reports.push(report);
            if failed {
                tracing::warn!(context_date = %date, "backfill stopped at failed run");
                break;
            }
        }
        Ok(reports)
    }

    /// Reads back the published partition for `date`.
    ///
    /// Returns `None` when no partition is published.
    ///
    /// # Errors
    ///
    /// Returns [`CompactionError::StoreUnavailable`] if the output store cannot
    /// be read, and [`CompactionError::Encode`] if the file is not a valid
    /// partition for `date`.
    pub async fn inspect(&self, date: ContextDate) -> Result<Option<PartitionSummary>> {
        let key = self.layout.partition_key(date);
        let bytes = match with_timeout(format!("get {key}"), self.config.io_timeout(), self.output.get(&key))
            .await?
        {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(CompactionError::store(format!("read {key}"), e)),
        };

        let contents = read_partition(date, &bytes)?;
        if let Some(recorded) = contents.recorded_date.as_deref() {
            if recorded != date.to_string() {
                return Err(CompactionError::Encode {
                    message: format!("{key} records context_date {recorded}"),
                });
            }
        }

        Ok(Some(PartitionSummary {
            key,
            context_date: date,
            size: bytes.len() as u64,
            rows: contents.rows.len() as u64,
            columns: contents
                .columns
                .into_iter()
                .map(|(name, data_type, nullable)| ColumnSummary {
                    name,
                    data_type,
                    nullable,
                })
                .collect(),
        }))
    }

    async fn execute(&self, date: ContextDate, dry_run: bool) -> (RunReport, Result<()>) {
        let run_id = Ulid::new().to_string();
        let span = compaction_span(&date.to_string(), &run_id, dry_run);
        let timer = CompactionTimer::start();
        let mut report = RunReport::start(run_id, date);

        let result = async {
            tracing::info!("compaction started");
            let result = self.run_leased(date, dry_run, &mut report).await;
            match &result {
                Ok(()) => tracing::info!(
                    outcome = report.outcome.as_str(),
                    objects_seen = report.objects_seen,
                    rows_written = report.rows_written,
                    rows_skipped = report.rows_skipped,
                    duplicates_dropped = report.duplicates_dropped,
                    "compaction finished"
                ),
                Err(e) => {
                    report.fail(e);
                    tracing::error!(error = %e, kind = e.kind(), "compaction failed");
                }
            }
            result
        }
        .instrument(span)
        .await;

        report.finish();
        timer.finish(&report);
        (report, result)
    }

    /// Holds the partition lease around [`Compactor::process`] and releases it
    /// whatever the outcome.
    async fn run_leased(&self, date: ContextDate, dry_run: bool, report: &mut RunReport) -> Result<()> {
        let budget = RunBudget::start(self.config.run_timeout());
        let lease = if dry_run {
            None
        } else {
            let run_id = report.run_id.clone();
            Some(
                budget
                    .run("acquire partition lease", self.acquire_lease(date, &run_id))
                    .await??,
            )
        };

        let result = self.process(date, lease.as_ref(), budget, report).await;

        if let Some(guard) = lease {
            let released = with_timeout("release partition lease", self.config.io_timeout(), guard.release()).await;
            match released {
                Ok(Ok(())) => tracing::debug!("released partition lease"),
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to release partition lease"),
                Err(e) => tracing::warn!(error = %e, "failed to release partition lease"),
            }
        }
        result
    }

    /// Collects rows under the run budget, then publishes or clears.
    ///
    /// The publish step runs to completion once started so the report never
    /// disagrees with what the store holds.
    async fn process(
        &self,
        date: ContextDate,
        lease: Option<&LeaseGuard<dyn StorageBackend>>,
        budget: RunBudget,
        report: &mut RunReport,
    ) -> Result<()> {
        let rows = budget
            .run("compaction run", self.collect_rows(date, report))
            .await??;

        if rows.is_empty() {
            match lease {
                Some(guard) => {
                    self.publisher.clear(date, guard).await?;
                    report.outcome = RunOutcome::SkippedEmpty;
                }
                None => report.outcome = RunOutcome::DryRun,
            }
            return Ok(());
        }

        let bytes = write_partition(date, &rows)?;
        match lease {
            Some(guard) => {
                let published = self.publisher.publish(date, bytes, guard).await?;
                report.output_key = Some(published.key);
                report.output_bytes = Some(published.size);
                report.outcome = RunOutcome::Written;
            }
            None => {
                report.output_bytes = Some(bytes.len() as u64);
                report.outcome = RunOutcome::DryRun;
            }
        }
        report.rows_written = rows.len() as u64;
        Ok(())
    }

    /// Lists, reads and flattens the bucket, returning sorted rows.
    async fn collect_rows(&self, date: ContextDate, report: &mut RunReport) -> Result<Vec<FlattenedRow>> {
        let keys = self.list_bucket(date).await?;
        report.objects_seen = keys.len() as u64;

        let mut rows = Vec::with_capacity(keys.len());
        for (key, flattened) in self.read_bucket(date, keys).await? {
            match flattened {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    tracing::debug!(key = %key, reason = %reason, "skipping malformed record");
                    report.record_skip(&key, &reason);
                }
            }
        }

        rows.sort_by_key(FlattenedRow::sort_key);
        if self.config.dedupe {
            report.duplicates_dropped = dedupe_by_message_id(&mut rows);
        }
        Ok(rows)
    }

    async fn acquire_lease(&self, date: ContextDate, run_id: &str) -> Result<LeaseGuard<dyn StorageBackend>> {
        let lease = PartitionLease::new(self.output.clone(), self.layout.lease_key(date), run_id);
        let guard = lease
            .acquire(self.config.lease_ttl(), self.config.lease_attempts)
            .await
            .map_err(|e| CompactionError::from_lease(date, e))?;
        tracing::debug!(
            lease = %lease.key(),
            fencing_token = %guard.fencing_token(),
            "acquired partition lease"
        );
        Ok(guard)
    }

    /// Lists the raw event keys for `date`, sorted.
    async fn list_bucket(&self, date: ContextDate) -> Result<Vec<String>> {
        let prefix = self.layout.raw_bucket_prefix(date);
        let objects = with_timeout(format!("list {prefix}"), self.config.io_timeout(), self.raw.list(&prefix))
            .await?
            .map_err(|e| CompactionError::store(format!("list {prefix}"), e))?;

        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.path)
            .filter(|key| self.layout.is_raw_event_key(date, key))
            .collect();
        keys.sort();
        keys.dedup();
        tracing::debug!(prefix = %prefix, objects = keys.len(), "listed raw bucket");
        Ok(keys)
    }

    /// Reads and flattens every key with bounded concurrency.
    ///
    /// Results come back in key order. A read failure aborts the run; a
    /// flatten failure is returned for the caller to count.
    async fn read_bucket(
        &self,
        date: ContextDate,
        keys: Vec<String>,
    ) -> Result<Vec<(String, std::result::Result<FlattenedRow, RejectReason>)>> {
        let io_timeout = self.config.io_timeout();
        futures::stream::iter(keys)
            .map(|key| async move {
                let bytes = with_timeout(format!("get {key}"), io_timeout, self.raw.get(&key))
                    .await?
                    .map_err(|e| CompactionError::store(format!("read {key}"), e))?;
                let flattened = flatten_bytes(&bytes, date);
                Ok::<_, CompactionError>((key, flattened))
            })
            .buffered(self.config.read_concurrency)
            .try_collect()
            .await
    }
}

/// Keeps the first row per `message_id`, returning how many were dropped.
fn dedupe_by_message_id(rows: &mut Vec<FlattenedRow>) -> u64 {
    let before = rows.len();
    let mut seen = HashSet::with_capacity(before);
    rows.retain(|row| seen.insert(row.message_id));
    (before - rows.len()) as u64
}

/// Summary of a published partition.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionSummary {
    /// Object key.
    pub key: String,
    /// Partition date, taken from the key.
    pub context_date: ContextDate,
    /// File size in bytes.
    pub size: u64,
    /// Number of rows.
    pub rows: u64,
    /// Stored columns.
    pub columns: Vec<ColumnSummary>,
}

/// One stored column.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSummary {
    /// Column name.
    pub name: String,
    /// Arrow data type.
    pub data_type: String,
    /// Whether the column admits nulls.
    pub nullable: bool,
}
