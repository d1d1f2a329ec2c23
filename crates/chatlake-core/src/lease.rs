//! Per-partition run lease backed by object storage.
//!
//! Two compaction runs for the same `context_date` must never publish
//! concurrently. Before touching a partition a run takes a lease object:
//!
//! 1. Create the lease with a `DoesNotExist` precondition. Only one writer wins.
//! 2. If a lease exists and has expired, take it over with a CAS on its version
//!    and bump the fencing sequence.
//! 3. Before publishing, the holder re-reads the lease and checks it still owns
//!    it ([`LeaseGuard::ensure_held`]).
//! 4. Release writes an already-expired record via CAS, leaving the sequence
//!    number in place for the next holder.
//!
//! ```rust,ignore
//! let lease = PartitionLease::new(storage.clone(), layout.lease_key(date), run_id);
//! let guard = lease.acquire(Duration::from_secs(900), 1).await?;
//! guard.ensure_held().await?;
//! // ... publish ...
//! guard.release().await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lease TTL. Long enough to cover a full daily run.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(20 * 60);

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Lease acquisition and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Another live holder owns the lease.
    #[error("lease {key} is held by {holder}")]
    Held {
        /// Lease object key.
        key: String,
        /// Current holder.
        holder: String,
    },

    /// The lease expired and was taken over (or removed) while we held it.
    #[error("lease {key} is no longer held by {holder}")]
    Lost {
        /// Lease object key.
        key: String,
        /// The holder that lost it.
        holder: String,
    },

    /// The lease object could not be read or written.
    #[error(transparent)]
    Storage(#[from] Error),
}

/// Monotonic token identifying one lease acquisition.
///
/// A takeover always produces a strictly greater token than the holder it
/// replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Returns the raw sequence number.
    #[must_use]
    pub fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contents of the lease object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Run that holds the lease.
    pub holder_id: String,
    /// When the lease expires.
    pub expires_at: DateTime<Utc>,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Fencing sequence, incremented on every acquisition.
    #[serde(default)]
    pub sequence_number: u64,
}

impl LeaseRecord {
    fn new(holder_id: &str, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.to_string(),
            expires_at: now + to_chrono(ttl),
            acquired_at: now,
            sequence_number,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn to_bytes(&self) -> Result<Bytes, Error> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Internal {
                message: format!("serialize lease: {e}"),
            })
    }
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

/// A lease on one partition key.
pub struct PartitionLease<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    key: String,
    holder_id: String,
}

impl<S: StorageBackend + ?Sized> PartitionLease<S> {
    /// Creates a lease handle for `key` on behalf of `holder_id` (usually the run id).
    #[must_use]
    pub fn new(storage: Arc<S>, key: impl Into<String>, holder_id: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            holder_id: holder_id.into(),
        }
    }

    /// Lease object key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquires the lease, retrying up to `max_attempts` times while it is held.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Held`] if another holder still owns the lease after
    /// all attempts, or [`LeaseError::Storage`] if the lease object is unreadable.
    pub async fn acquire(&self, ttl: Duration, max_attempts: u32) -> Result<LeaseGuard<S>, LeaseError> {
        let mut attempts = 0;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.try_acquire(ttl).await {
                Ok(guard) => return Ok(guard),
                Err(LeaseError::Held { key, holder }) => {
                    attempts += 1;
                    if attempts >= max_attempts.max(1) {
                        return Err(LeaseError::Held { key, holder });
                    }
                    tracing::debug!(lease = %key, holder = %holder, ?backoff, "lease busy, backing off");
                    tokio::time::sleep(backoff.min(BACKOFF_MAX)).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_acquire(&self, ttl: Duration) -> Result<LeaseGuard<S>, LeaseError> {
        let fresh = LeaseRecord::new(&self.holder_id, ttl, 1);
        match self
            .storage
            .put(&self.key, fresh.to_bytes()?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => return Ok(self.guard(version, 1)),
            WriteResult::PreconditionFailed { .. } => {}
        }

        // Bind the expiry decision to the version we CAS against: HEAD first,
        // then read contents.
        let Some(meta) = self.storage.head(&self.key).await? else {
            return Err(self.held_by("race"));
        };
        let Some(existing) = read_record(self.storage.as_ref(), &self.key).await? else {
            return Err(self.held_by("race"));
        };
        if !existing.is_expired() {
            return Err(self.held_by(&existing.holder_id));
        }

        let sequence = existing.sequence_number.saturating_add(1);
        let takeover = LeaseRecord::new(&self.holder_id, ttl, sequence);
        match self
            .storage
            .put(
                &self.key,
                takeover.to_bytes()?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => {
                tracing::info!(
                    lease = %self.key,
                    previous_holder = %existing.holder_id,
                    sequence,
                    "took over expired lease"
                );
                Ok(self.guard(version, sequence))
            }
            WriteResult::PreconditionFailed { .. } => Err(self.held_by("unknown")),
        }
    }

    /// Returns the current lease record, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease object cannot be read or parsed.
    pub async fn current(&self) -> Result<Option<LeaseRecord>, Error> {
        read_record(self.storage.as_ref(), &self.key).await
    }

    /// Returns true if a live (unexpired) lease exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease object cannot be read or parsed.
    pub async fn is_held(&self) -> Result<bool, Error> {
        Ok(self.current().await?.is_some_and(|r| !r.is_expired()))
    }

    fn held_by(&self, holder: &str) -> LeaseError {
        LeaseError::Held {
            key: self.key.clone(),
            holder: holder.to_string(),
        }
    }

    fn guard(&self, version: String, sequence: u64) -> LeaseGuard<S> {
        LeaseGuard {
            storage: Arc::clone(&self.storage),
            key: self.key.clone(),
            holder_id: self.holder_id.clone(),
            version,
            fencing_token: FencingToken(sequence),
            released: false,
        }
    }
}

async fn read_record<S: StorageBackend + ?Sized>(
    storage: &S,
    key: &str,
) -> Result<Option<LeaseRecord>, Error> {
    match storage.get(key).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::Internal {
                message: format!("parse lease {key}: {e}"),
            }),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// A held lease. Released explicitly with [`LeaseGuard::release`], or
/// best-effort on drop.
pub struct LeaseGuard<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    key: String,
    holder_id: String,
    version: String,
    fencing_token: FencingToken,
    released: bool,
}

impl<S: StorageBackend + ?Sized> LeaseGuard<S> {
    /// Holder id of this lease.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Fencing token of this acquisition.
    #[must_use]
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    /// Verifies the lease is still ours and has not expired.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Lost`] if the lease was taken over, rewritten, or
    /// expired.
    pub async fn ensure_held(&self) -> Result<(), LeaseError> {
        let meta = self.storage.head(&self.key).await?;
        let record = read_record(self.storage.as_ref(), &self.key).await?;
        let ours = matches!(
            (&meta, &record),
            (Some(meta), Some(record))
                if meta.version == self.version
                    && record.holder_id == self.holder_id
                    && record.sequence_number == self.fencing_token.sequence()
                    && !record.is_expired()
        );
        if ours {
            Ok(())
        } else {
            Err(LeaseError::Lost {
                key: self.key.clone(),
                holder: self.holder_id.clone(),
            })
        }
    }

    /// Releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease object could not be read or written.
    pub async fn release(mut self) -> Result<(), Error> {
        self.released = true;
        expire_if_owned(self.storage.as_ref(), &self.key, &self.holder_id, &self.version).await
    }
}

/// Writes an expired copy of the record if `holder` still owns `version`.
/// A concurrent takeover makes the CAS fail, which leaves the new holder intact.
async fn expire_if_owned<S: StorageBackend + ?Sized>(
    storage: &S,
    key: &str,
    holder: &str,
    version: &str,
) -> Result<(), Error> {
    let Some(record) = read_record(storage, key).await? else {
        return Ok(());
    };
    if record.holder_id != holder {
        return Ok(());
    }
    let expired = LeaseRecord {
        expires_at: Utc::now() - chrono::Duration::seconds(1),
        ..record
    };
    let _ = storage
        .put(
            key,
            expired.to_bytes()?,
            WritePrecondition::MatchesVersion(version.to_string()),
        )
        .await?;
    Ok(())
}

impl<S: StorageBackend + ?Sized> Drop for LeaseGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Outside a runtime the TTL takes care of it.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let storage = Arc::clone(&self.storage);
        let key = self.key.clone();
        let holder = self.holder_id.clone();
        let version = self.version.clone();
        handle.spawn(async move {
            if let Err(e) = expire_if_owned(storage.as_ref(), &key, &holder, &version).await {
                tracing::warn!(lease = %key, error = %e, "failed to release lease on drop");
            }
        });
    }
}
