//! Test storage with operation tracing.
//!
//! [`TracingMemoryBackend`] wraps a [`MemoryBackend`] and records every call
//! so tests can assert which keys a run touched. Failures and stalls can be
//! injected per key prefix and per operation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chatlake_core::error::{Error, Result};
use chatlake_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// Kind of storage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `get`
    Get,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// `list`
    List,
    /// `head`
    Head,
}

/// Record of a storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOp {
    /// Which call.
    pub kind: OpKind,
    /// Key, or prefix for `list`.
    pub path: String,
    /// Precondition, for `put`.
    pub precondition: Option<WritePrecondition>,
}

impl StorageOp {
    /// Whether this call can change stored data.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(self.kind, OpKind::Put | OpKind::Delete)
    }
}

#[derive(Debug, Clone)]
struct Injection {
    prefix: String,
    kind: Option<OpKind>,
}

impl Injection {
    fn applies(&self, kind: OpKind, path: &str) -> bool {
        path.starts_with(&self.prefix) && self.kind.map_or(true, |k| k == kind)
    }
}

/// In-memory storage that records operations and misbehaves on request.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    failures: Arc<Mutex<Vec<Injection>>>,
    stalls: Arc<Mutex<Vec<(Injection, Duration)>>>,
}

impl TracingMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded operations, oldest first.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every call on keys starting with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.push_failure(prefix.into(), None);
    }

    /// Fails only `kind` calls on keys starting with `prefix`.
    pub fn inject_failure_on(&self, kind: OpKind, prefix: impl Into<String>) {
        self.push_failure(prefix.into(), Some(kind));
    }

    /// Delays `kind` calls on keys starting with `prefix` by `delay`.
    pub fn inject_stall(&self, kind: OpKind, prefix: impl Into<String>, delay: Duration) {
        self.stalls.lock().expect("lock").push((
            Injection {
                prefix: prefix.into(),
                kind: Some(kind),
            },
            delay,
        ));
    }

    /// Removes all injected failures and stalls.
    pub fn clear_failures(&self) {
        self.failures.lock().expect("lock").clear();
        self.stalls.lock().expect("lock").clear();
    }

    /// Returns all stored keys, sorted.
    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list("")
            .await
            .expect("memory list")
            .into_iter()
            .map(|m| m.path)
            .collect();
        paths.sort();
        paths
    }

    /// Puts `data` at `path` without recording the call.
    pub async fn seed(&self, path: &str, data: impl Into<Bytes>) {
        self.inner
            .put(path, data.into(), WritePrecondition::None)
            .await
            .expect("memory put");
    }

    fn push_failure(&self, prefix: String, kind: Option<OpKind>) {
        self.failures
            .lock()
            .expect("lock")
            .push(Injection { prefix, kind });
    }

    async fn enter(
        &self,
        kind: OpKind,
        path: &str,
        precondition: Option<WritePrecondition>,
    ) -> Result<()> {
        let stall = self
            .stalls
            .lock()
            .expect("lock")
            .iter()
            .find(|(inj, _)| inj.applies(kind, path))
            .map(|(_, d)| *d);
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        self.operations.lock().expect("lock").push(StorageOp {
            kind,
            path: path.to_string(),
            precondition,
        });

        let failing = self
            .failures
            .lock()
            .expect("lock")
            .iter()
            .any(|inj| inj.applies(kind, path));
        if failing {
            return Err(Error::storage(format!("injected {kind:?} failure for {path}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.enter(OpKind::Get, path, None).await?;
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.enter(OpKind::Put, path, Some(precondition.clone())).await?;
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.enter(OpKind::Delete, path, None).await?;
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.enter(OpKind::List, prefix, None).await?;
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.enter(OpKind::Head, path, None).await?;
        self.inner.head(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_operations_in_order() {
        let storage = TracingMemoryBackend::new();
        storage
            .put("a.json", Bytes::from("{}"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        let _ = storage.get("a.json").await;
        let _ = storage.list("").await;

        let kinds: Vec<OpKind> = storage.operations().iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::Put, OpKind::Get, OpKind::List]);
        assert_eq!(
            storage.operations()[0].precondition,
            Some(WritePrecondition::DoesNotExist)
        );
    }

    #[tokio::test]
    async fn failures_are_scoped_by_prefix_and_kind() {
        let storage = TracingMemoryBackend::new();
        storage.seed("raw/a.json", "{}").await;
        storage.inject_failure_on(OpKind::Get, "raw/");

        assert!(storage.get("raw/a.json").await.is_err());
        assert!(storage.list("raw/").await.is_ok());
        assert!(storage.head("raw/a.json").await.is_ok());

        storage.clear_failures();
        assert!(storage.get("raw/a.json").await.is_ok());
    }

    #[tokio::test]
    async fn seeding_is_not_recorded() {
        let storage = TracingMemoryBackend::new();
        storage.seed("k", "v").await;
        assert!(storage.operations().is_empty());
        assert_eq!(storage.paths().await, vec!["k".to_string()]);
    }
}
