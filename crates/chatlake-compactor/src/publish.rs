//! Publishing and clearing compacted partitions.
//!
//! Every mutation of a partition goes through [`PartitionPublisher`], which
//! checks the run still holds the partition lease first. The artifact is
//! written with a single `put`; backends make that visible all at once, so a
//! reader sees either the previous file or the new one.
//!
//! Reads that precede a mutation are bounded by the per-call timeout. The
//! mutation itself is not: abandoning a filesystem put or delete midway does
//! not stop it, so the outcome would be unknown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use chatlake_core::{
    ContextDate, LeaseGuard, StorageBackend, StorageLayout, WritePrecondition, WriteResult,
};

use crate::error::{with_timeout, CompactionError, Result};

/// A published partition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPartition {
    /// Output object key.
    pub key: String,
    /// Backend version of the written object.
    pub version: String,
    /// Size in bytes.
    pub size: u64,
}

/// Writes partition artifacts under the output prefix.
pub struct PartitionPublisher {
    storage: Arc<dyn StorageBackend>,
    layout: StorageLayout,
    io_timeout: Duration,
}

impl PartitionPublisher {
    /// Creates a publisher over the output store.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, layout: StorageLayout, io_timeout: Duration) -> Self {
        Self {
            storage,
            layout,
            io_timeout,
        }
    }

    /// Replaces the partition file for `date` with `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CompactionError::LeaseLost`] if the lease is no longer ours
    /// ([`CompactionError::Timeout`] if that check stalls), and
    /// [`CompactionError::WriteFailure`] if the write fails. On error the
    /// previous file (if any) is untouched.
    pub async fn publish(
        &self,
        date: ContextDate,
        bytes: Bytes,
        lease: &LeaseGuard<dyn StorageBackend>,
    ) -> Result<PublishedPartition> {
        self.check_lease(date, lease).await?;

        let key = self.layout.partition_key(date);
        let size = bytes.len() as u64;
        let result = self
            .storage
            .put(&key, bytes, WritePrecondition::None)
            .await
            .map_err(|e| write_failure(&key, e))?;

        match result {
            WriteResult::Success { version } => {
                tracing::info!(key = %key, size, version = %version, "published partition");
                Ok(PublishedPartition { key, version, size })
            }
            WriteResult::PreconditionFailed { current_version } => Err(CompactionError::WriteFailure {
                key,
                message: format!("unexpected precondition failure (current version {current_version})"),
            }),
        }
    }

    /// Removes the partition file for `date`, if present.
    ///
    /// Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Same as [`PartitionPublisher::publish`].
    pub async fn clear(&self, date: ContextDate, lease: &LeaseGuard<dyn StorageBackend>) -> Result<bool> {
        self.check_lease(date, lease).await?;

        let key = self.layout.partition_key(date);
        let existed = with_timeout(format!("head {key}"), self.io_timeout, self.storage.head(&key))
            .await?
            .map_err(|e| write_failure(&key, e))?
            .is_some();
        if existed {
            self.storage
                .delete(&key)
                .await
                .map_err(|e| write_failure(&key, e))?;
            tracing::info!(key = %key, "removed partition for empty bucket");
        }
        Ok(existed)
    }

    async fn check_lease(&self, date: ContextDate, lease: &LeaseGuard<dyn StorageBackend>) -> Result<()> {
        with_timeout("verify partition lease", self.io_timeout, lease.ensure_held())
            .await?
            .map_err(|e| CompactionError::from_lease(date, e))
    }
}

fn write_failure(key: &str, err: chatlake_core::Error) -> CompactionError {
    CompactionError::WriteFailure {
        key: key.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlake_core::lease::LeaseRecord;
    use chatlake_core::{MemoryBackend, PartitionLease};

    fn date() -> ContextDate {
        "2025-10-29".parse().unwrap()
    }

    async fn setup() -> (Arc<dyn StorageBackend>, PartitionPublisher, LeaseGuard<dyn StorageBackend>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let layout = StorageLayout::default();
        let guard = PartitionLease::new(storage.clone(), layout.lease_key(date()), "run-a")
            .acquire(Duration::from_secs(60), 1)
            .await
            .expect("lease");
        let publisher = PartitionPublisher::new(storage.clone(), layout, Duration::from_secs(5));
        (storage, publisher, guard)
    }

    #[tokio::test]
    async fn publish_replaces_previous_file() {
        let (storage, publisher, guard) = setup().await;

        publisher
            .publish(date(), Bytes::from_static(b"old"), &guard)
            .await
            .expect("first");
        let published = publisher
            .publish(date(), Bytes::from_static(b"new"), &guard)
            .await
            .expect("second");

        assert_eq!(published.key, "compacted/messages/context_date=2025-10-29/part-00000.parquet");
        assert_eq!(published.size, 3);
        assert_eq!(storage.get(&published.key).await.unwrap(), Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn clear_removes_existing_file() {
        let (storage, publisher, guard) = setup().await;
        assert!(!publisher.clear(date(), &guard).await.expect("clear empty"));

        publisher
            .publish(date(), Bytes::from_static(b"data"), &guard)
            .await
            .expect("publish");
        assert!(publisher.clear(date(), &guard).await.expect("clear"));
        let key = StorageLayout::default().partition_key(date());
        assert!(storage.head(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_lease_blocks_publish() {
        let (storage, publisher, guard) = setup().await;
        // Another run takes the lease over.
        let now = chrono::Utc::now();
        let takeover = LeaseRecord {
            holder_id: "run-b".into(),
            expires_at: now + chrono::Duration::minutes(5),
            acquired_at: now,
            sequence_number: 2,
        };
        storage
            .put(
                &StorageLayout::default().lease_key(date()),
                Bytes::from(serde_json::to_vec(&takeover).unwrap()),
                WritePrecondition::None,
            )
            .await
            .unwrap();

        let err = publisher
            .publish(date(), Bytes::from_static(b"data"), &guard)
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::LeaseLost { .. }));
        let key = StorageLayout::default().partition_key(date());
        assert!(storage.head(&key).await.unwrap().is_none());
    }
}
