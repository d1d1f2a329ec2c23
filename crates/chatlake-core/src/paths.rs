//! Object key layout for raw events and compacted partitions.
//!
//! ```text
//! {raw_prefix}/context_date=YYYY-MM-DD/{anything}.json        raw events (one per message)
//! {output_prefix}/context_date=YYYY-MM-DD/part-00000.parquet  compacted partition
//! {output_prefix}/_locks/context_date=YYYY-MM-DD.lock.json    per-partition run lease
//! ```
//!
//! Prefixes always end at a `/` boundary so that listing one date never
//! matches keys belonging to another.

use serde::{Deserialize, Serialize};

use crate::partition::ContextDate;

/// File name of the single compacted object in each partition.
pub const PARTITION_FILE_NAME: &str = "part-00000.parquet";

/// Extension of raw event objects.
pub const RAW_EVENT_EXTENSION: &str = ".json";

const LOCKS_DIR: &str = "_locks";

/// Key layout shared by the compactor and its readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    raw_prefix: String,
    output_prefix: String,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("raw/messages", "compacted/messages")
    }
}

impl StorageLayout {
    /// Creates a layout. Leading and trailing slashes are ignored.
    #[must_use]
    pub fn new(raw_prefix: impl AsRef<str>, output_prefix: impl AsRef<str>) -> Self {
        Self {
            raw_prefix: normalize(raw_prefix.as_ref()),
            output_prefix: normalize(output_prefix.as_ref()),
        }
    }

    /// Raw prefix without trailing slash.
    #[must_use]
    pub fn raw_prefix(&self) -> &str {
        &self.raw_prefix
    }

    /// Output prefix without trailing slash.
    #[must_use]
    pub fn output_prefix(&self) -> &str {
        &self.output_prefix
    }

    /// Listing prefix for one raw bucket, ending in `/`.
    #[must_use]
    pub fn raw_bucket_prefix(&self, date: ContextDate) -> String {
        join(&self.raw_prefix, &format!("{}/", date.segment()))
    }

    /// Returns true if `key` is a raw event object inside the bucket for `date`.
    #[must_use]
    pub fn is_raw_event_key(&self, date: ContextDate, key: &str) -> bool {
        key.starts_with(&self.raw_bucket_prefix(date)) && key.ends_with(RAW_EVENT_EXTENSION)
    }

    /// Directory prefix of one compacted partition, ending in `/`.
    #[must_use]
    pub fn partition_prefix(&self, date: ContextDate) -> String {
        join(&self.output_prefix, &format!("{}/", date.segment()))
    }

    /// Key of the compacted object for `date`.
    #[must_use]
    pub fn partition_key(&self, date: ContextDate) -> String {
        format!("{}{PARTITION_FILE_NAME}", self.partition_prefix(date))
    }

    /// Key of the run lease for `date`.
    #[must_use]
    pub fn lease_key(&self, date: ContextDate) -> String {
        join(
            &self.output_prefix,
            &format!("{LOCKS_DIR}/{}.lock.json", date.segment()),
        )
    }
}

fn normalize(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

fn join(prefix: &str, rest: &str) -> String {
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{prefix}/{rest}")
    }
}
