//! Filesystem-backed storage for local runs and single-host deployments.
//!
//! Object keys map to paths below a root directory. Every write goes to a
//! hidden temporary sibling first and is moved into place with a rename, so a
//! reader never sees a partially written object.
//!
//! Version tokens are the SHA-256 of the object contents.
//!
//! Conditional puts hold across processes sharing the directory:
//! `DoesNotExist` creates with `hard_link`, which fails if the target exists,
//! and `MatchesVersion` compares and renames while holding an exclusive
//! `.{name}.cas-lock` sibling created with `create_new`. A lock left by a
//! crashed writer is broken once it is 30 seconds old. Temp siblings older
//! than an hour are swept before the next write to the same target.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

const TEMP_MARKER: &str = ".tmp-";
const CAS_LOCK_SUFFIX: &str = ".cas-lock";

/// Temp siblings older than this are leftovers of an interrupted write.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// CAS locks older than this belong to a writer that died holding them.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

const CAS_LOCK_WAIT: Duration = Duration::from_secs(5);
const CAS_LOCK_POLL: Duration = Duration::from_millis(10);

/// Storage backend rooted at a local directory.
#[derive(Debug)]
pub struct LocalFsBackend {
    root: PathBuf,
    // Serializes puts within this process; the lock file covers other processes.
    cas_lock: Mutex<()>,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cas_lock: Mutex::new(()),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::InvalidInput(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<Bytes>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("read {}", path.display()),
                e,
            )),
        }
    }

    async fn meta_for(&self, key: &str, path: &Path) -> Result<Option<ObjectMeta>> {
        let Some(data) = self.read_optional(path).await? else {
            return Ok(None);
        };
        let last_modified = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(Some(ObjectMeta {
            path: key.to_string(),
            size: data.len() as u64,
            version: content_version(&data),
            last_modified,
        }))
    }

    /// Writes `data` to a temporary sibling of `target` and returns its path.
    async fn stage(&self, target: &Path, data: &[u8]) -> Result<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("no parent for {}", target.display())))?;
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::storage_with_source(format!("create dir {}", parent.display()), e)
        })?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("bad file name {}", target.display())))?;
        sweep_stale_temps(parent, file_name).await;
        let temp = parent.join(format!(".{file_name}{TEMP_MARKER}{}", Ulid::new()));

        let mut file = tokio::fs::File::create(&temp).await.map_err(|e| {
            Error::storage_with_source(format!("create {}", temp.display()), e)
        })?;
        file.write_all(data)
            .await
            .map_err(|e| Error::storage_with_source(format!("write {}", temp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::storage_with_source(format!("sync {}", temp.display()), e))?;
        Ok(temp)
    }

    /// Stages `data` and renames it over `target`.
    async fn replace(&self, target: &Path, data: &[u8], version: String) -> Result<WriteResult> {
        let temp = self.stage(target, data).await?;
        if let Err(e) = tokio::fs::rename(&temp, target).await {
            Self::discard(&temp).await;
            return Err(Error::storage_with_source(
                format!("rename into {}", target.display()),
                e,
            ));
        }
        Ok(WriteResult::Success { version })
    }

    async fn discard(temp: &Path) {
        if let Err(e) = tokio::fs::remove_file(temp).await {
            tracing::warn!(path = %temp.display(), error = %e, "failed to remove temp file");
        }
    }
}

/// Exclusive lock on one target, held for the duration of a CAS.
struct CasLock {
    path: PathBuf,
}

impl CasLock {
    async fn acquire(target: &Path) -> Result<Self> {
        let path = hidden_sibling(target, CAS_LOCK_SUFFIX)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage_with_source(format!("create dir {}", parent.display()), e)
            })?;
        }

        let started = Instant::now();
        loop {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match created {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if age_of(&path).await.is_some_and(|age| age >= STALE_LOCK_AGE) {
                        tracing::warn!(path = %path.display(), "breaking stale cas lock");
                        LocalFsBackend::discard(&path).await;
                        continue;
                    }
                    if started.elapsed() >= CAS_LOCK_WAIT {
                        return Err(Error::storage(format!(
                            "cas lock {} still held after {CAS_LOCK_WAIT:?}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(CAS_LOCK_POLL).await;
                }
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("create {}", path.display()),
                        e,
                    ));
                }
            }
        }
    }
}

impl Drop for CasLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove cas lock");
            }
        }
    }
}

fn hidden_sibling(target: &Path, suffix: &str) -> Result<PathBuf> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("bad file name {}", target.display())))?;
    Ok(target.with_file_name(format!(".{file_name}{suffix}")))
}

async fn age_of(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    modified.elapsed().ok()
}

/// Removes temp siblings of `file_name` left behind by interrupted writes.
async fn sweep_stale_temps(parent: &Path, file_name: &str) {
    let prefix = format!(".{file_name}{TEMP_MARKER}");
    let Ok(mut entries) = tokio::fs::read_dir(parent).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_temp = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(&prefix));
        if !is_temp {
            continue;
        }
        let path = entry.path();
        if age_of(&path).await.is_some_and(|age| age >= STALE_TEMP_AGE) {
            tracing::debug!(path = %path.display(), "removing stale temp file");
            LocalFsBackend::discard(&path).await;
        }
    }
}

fn content_version(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        self.read_optional(&full)
            .await?
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let target = self.resolve(path)?;
        let version = content_version(&data);
        let _cas = self.cas_lock.lock().await;

        match &precondition {
            WritePrecondition::None => {}
            WritePrecondition::DoesNotExist => {
                let temp = self.stage(&target, &data).await?;
                // hard_link fails if the target exists.
                let linked = tokio::fs::hard_link(&temp, &target).await;
                Self::discard(&temp).await;
                return match linked {
                    Ok(()) => Ok(WriteResult::Success { version }),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        let current = self.read_optional(&target).await?.unwrap_or_default();
                        Ok(WriteResult::PreconditionFailed {
                            current_version: content_version(&current),
                        })
                    }
                    Err(e) => Err(Error::storage_with_source(
                        format!("link {}", target.display()),
                        e,
                    )),
                };
            }
            WritePrecondition::MatchesVersion(expected) => {
                let _lock = CasLock::acquire(&target).await?;
                let current = self.read_optional(&target).await?;
                let current_version =
                    current.map_or_else(|| "0".to_string(), |c| content_version(&c));
                if &current_version != expected {
                    return Ok(WriteResult::PreconditionFailed { current_version });
                }
                return self.replace(&target, &data, version).await;
            }
        }

        self.replace(&target, &data, version).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("delete {}", full.display()),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Start from the deepest directory fully named by the prefix.
        let dir_part = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part)?
        };

        let mut out = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("list {}", dir.display()),
                        e,
                    ));
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                Error::storage_with_source(format!("list {}", dir.display()), e)
            })? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| {
                    Error::storage_with_source(format!("stat {}", path.display()), e)
                })?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let hidden = entry
                    .file_name()
                    .to_str()
                    .map_or(true, |n| n.starts_with('.'));
                if hidden {
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }
                if let Some(meta) = self.meta_for(&key, &path).await? {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let full = self.resolve(path)?;
        self.meta_for(path, &full).await
    }
}
