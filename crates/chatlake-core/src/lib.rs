//! # chatlake-core
//!
//! Shared primitives for the chatlake batch compaction pipeline.
//!
//! - **Storage**: the [`StorageBackend`] contract with in-memory and local
//!   filesystem implementations
//! - **Partitioning**: the [`ContextDate`] bucket key and the [`StorageLayout`]
//!   that maps buckets to object keys
//! - **Coordination**: the per-partition [`PartitionLease`]
//! - **Observability**: logging initialization and run spans
//!
//! ## Example
//!
//! ```rust
//! use chatlake_core::prelude::*;
//!
//! let layout = StorageLayout::default();
//! let date: ContextDate = "2025-10-29".parse().unwrap();
//! assert!(layout.partition_key(date).contains("context_date=2025-10-29"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod lease;
pub mod local_fs;
pub mod observability;
pub mod partition;
pub mod paths;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::lease::{FencingToken, LeaseError, LeaseGuard, PartitionLease};
    pub use crate::local_fs::LocalFsBackend;
    pub use crate::partition::ContextDate;
    pub use crate::paths::StorageLayout;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use lease::{DEFAULT_LEASE_TTL, FencingToken, LeaseError, LeaseGuard, PartitionLease};
pub use local_fs::LocalFsBackend;
pub use observability::{LogFormat, compaction_span, init_logging};
pub use partition::{ContextDate, PARTITION_COLUMN};
pub use paths::{PARTITION_FILE_NAME, StorageLayout};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
