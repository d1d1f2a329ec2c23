//! Failure injection: store, publish, lease and timeout failures must leave
//! the target partition absent or unchanged.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chatlake_compactor::{CompactionError, Compactor, CompactorConfig, RunOutcome};
use chatlake_core::{ContextDate, PartitionLease, StorageBackend};
use chatlake_test_utils::{OpKind, TracingMemoryBackend, seed_bucket, two_message_bucket};

fn date() -> ContextDate {
    "2025-10-29".parse().unwrap()
}

fn setup(config: CompactorConfig) -> (Arc<TracingMemoryBackend>, Compactor) {
    let storage = Arc::new(TracingMemoryBackend::new());
    let backend: Arc<dyn StorageBackend> = storage.clone();
    let compactor = Compactor::new(backend.clone(), backend, config).expect("compactor");
    (storage, compactor)
}

#[tokio::test]
async fn list_failure_keeps_previous_partition() {
    let (storage, compactor) = setup(CompactorConfig::default());
    seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;
    compactor.compact(date()).await.expect("initial run");
    let key = compactor.layout().partition_key(date());
    let before = storage.get(&key).await.unwrap();

    storage.inject_failure_on(OpKind::List, compactor.layout().raw_bucket_prefix(date()));
    let err = compactor.compact(date()).await.unwrap_err();
    assert!(matches!(err, CompactionError::StoreUnavailable { .. }));

    storage.clear_failures();
    assert_eq!(storage.get(&key).await.unwrap(), before);
}

#[tokio::test]
async fn store_failure_releases_the_lease_for_an_immediate_retry() {
    let (storage, compactor) = setup(CompactorConfig::default());
    seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;
    storage.inject_failure_on(OpKind::List, compactor.layout().raw_bucket_prefix(date()));

    let err = compactor.compact(date()).await.unwrap_err();
    assert!(matches!(err, CompactionError::StoreUnavailable { .. }));

    storage.clear_failures();
    let report = compactor.compact(date()).await.expect("retry is not blocked by the lease");
    assert_eq!(report.outcome, RunOutcome::Written);
}

#[tokio::test]
async fn read_failure_aborts_without_publishing() {
    let (storage, compactor) = setup(CompactorConfig::default());
    let keys = seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;
    storage.inject_failure_on(OpKind::Get, keys[1].clone());

    let report = compactor.run(date(), false).await;
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.error_kind, Some("store_unavailable"));
    assert!(report.output_key.is_none());

    let partition = compactor.layout().partition_key(date());
    assert!(storage.head(&partition).await.unwrap().is_none());
}

#[tokio::test]
async fn publish_failure_leaves_no_partial_file() {
    let (storage, compactor) = setup(CompactorConfig::default());
    seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;
    storage.inject_failure_on(OpKind::Put, compactor.layout().partition_prefix(date()));

    let report = compactor.run(date(), false).await;
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.error_kind, Some("write_failure"));
    assert_eq!(report.rows_written, 0);

    storage.clear_failures();
    let prefix = compactor.layout().partition_prefix(date());
    assert!(storage.paths().await.iter().all(|p| !p.starts_with(&prefix)));

    compactor.compact(date()).await.expect("retry publishes");
    assert!(storage.paths().await.contains(&compactor.layout().partition_key(date())));
}

#[tokio::test]
async fn slow_publish_completes_and_matches_the_report() {
    let config = CompactorConfig {
        io_timeout_secs: 1,
        ..CompactorConfig::default()
    };
    let (storage, compactor) = setup(config);
    seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;
    let partition = compactor.layout().partition_key(date());
    storage.inject_stall(OpKind::Put, partition.clone(), Duration::from_millis(1_500));

    let report = compactor.compact(date()).await.expect("publish is not cut short");
    assert_eq!(report.outcome, RunOutcome::Written);
    assert_eq!(report.output_key.as_deref(), Some(partition.as_str()));
    assert!(storage.head(&partition).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_run_is_rejected_while_lease_is_held() {
    let (storage, compactor) = setup(CompactorConfig::default());
    seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;

    let backend: Arc<dyn StorageBackend> = storage.clone();
    let other_run = PartitionLease::new(backend, compactor.layout().lease_key(date()), "other-run")
        .acquire(Duration::from_secs(60), 1)
        .await
        .expect("other run holds the lease");

    let err = compactor.compact(date()).await.unwrap_err();
    assert!(matches!(
        err,
        CompactionError::LeaseHeld { ref holder, .. } if holder == "other-run"
    ));
    let partition = compactor.layout().partition_key(date());
    assert!(storage.head(&partition).await.unwrap().is_none());

    other_run.release().await.expect("release");
    compactor.compact(date()).await.expect("runs once the lease is free");
}

#[tokio::test]
async fn slow_reads_hit_the_io_timeout() {
    let config = CompactorConfig {
        io_timeout_secs: 1,
        ..CompactorConfig::default()
    };
    let (storage, compactor) = setup(config);
    let keys = seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;
    storage.inject_stall(OpKind::Get, keys[0].clone(), Duration::from_secs(3));

    let err = compactor.compact(date()).await.unwrap_err();
    assert!(matches!(err, CompactionError::Timeout { seconds: 1, .. }));
    let partition = compactor.layout().partition_key(date());
    assert!(storage.head(&partition).await.unwrap().is_none());
}

#[tokio::test]
async fn run_budget_aborts_cleanly() {
    let config = CompactorConfig {
        run_timeout_secs: 1,
        lease_ttl_secs: 5,
        ..CompactorConfig::default()
    };
    let (storage, compactor) = setup(config);
    seed_bucket(&storage, compactor.layout(), date(), &two_message_bucket()).await;
    storage.inject_stall(
        OpKind::List,
        compactor.layout().raw_bucket_prefix(date()),
        Duration::from_secs(3),
    );

    let report = compactor.run(date(), false).await;
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.error_kind, Some("timeout"));
    let partition = compactor.layout().partition_key(date());
    assert!(storage.head(&partition).await.unwrap().is_none());

    storage.clear_failures();
    compactor.compact(date()).await.expect("next run proceeds");
}

#[tokio::test]
async fn backfill_stops_at_first_failure() {
    let (storage, compactor) = setup(CompactorConfig::default());
    let first = date();
    let second = first.next();
    seed_bucket(&storage, compactor.layout(), first, &two_message_bucket()).await;
    storage.inject_failure(compactor.layout().raw_bucket_prefix(second));

    let reports = compactor
        .backfill(first, second.next(), false)
        .await
        .expect("valid range");
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].outcome, RunOutcome::Written);
    assert_eq!(reports[1].outcome, RunOutcome::Failed);
}
