//! Partition lease behaviour on the filesystem backend.
//!
//! The lease relies on conditional puts; these tests pin down that the
//! content-digest versions of `LocalFsBackend` give the same guarantees as the
//! in-memory generation counter.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chatlake_core::prelude::*;

fn date() -> ContextDate {
    "2025-10-29".parse().expect("date")
}

#[tokio::test]
async fn lease_excludes_concurrent_runs_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(LocalFsBackend::new(dir.path()));
    let key = StorageLayout::default().lease_key(date());

    let first = PartitionLease::new(backend.clone(), key.clone(), "run-a");
    let second = PartitionLease::new(backend.clone(), key.clone(), "run-b");

    let guard = first.acquire(Duration::from_secs(60), 1).await.expect("acquire");
    let contested = second.acquire(Duration::from_secs(60), 2).await;
    assert!(matches!(contested, Err(LeaseError::Held { .. })));

    guard.ensure_held().await.expect("still held");
    guard.release().await.expect("release");

    let next = second.acquire(Duration::from_secs(60), 1).await.expect("reacquire");
    assert_eq!(next.fencing_token().sequence(), 2);
    next.release().await.expect("release");
}

#[tokio::test]
async fn lease_object_is_outside_the_listing_of_any_partition() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(LocalFsBackend::new(dir.path()));
    let layout = StorageLayout::default();

    let lease = PartitionLease::new(backend.clone(), layout.lease_key(date()), "run-a");
    let guard = lease.acquire(Duration::from_secs(60), 1).await.expect("acquire");

    let listed = backend
        .list(&layout.partition_prefix(date()))
        .await
        .expect("list");
    assert!(listed.is_empty());

    guard.release().await.expect("release");
}
