//! The `context_date` partition key.
//!
//! Raw events and compacted output are both bucketed by calendar date, and the
//! bucket is encoded in object keys as a hive-style path segment:
//!
//! ```text
//! context_date=YYYY-MM-DD
//! ```
//!
//! # Examples
//!
//! ```rust
//! use chatlake_core::partition::ContextDate;
//!
//! let date: ContextDate = "2025-10-29".parse().unwrap();
//! assert_eq!(date.segment(), "context_date=2025-10-29");
//! assert_eq!(date.previous().to_string(), "2025-10-28");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Name of the partition column, as used in keys and by the query layer.
pub const PARTITION_COLUMN: &str = "context_date";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A calendar date identifying one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextDate(NaiveDate);

impl ContextDate {
    /// Returns the day before the UTC calendar date of `now`.
    ///
    /// This is the default target for the daily run.
    #[must_use]
    pub fn yesterday_of(now: DateTime<Utc>) -> Self {
        Self(now.date_naive()).previous()
    }

    /// Returns the day before the current UTC date.
    #[must_use]
    pub fn yesterday() -> Self {
        Self::yesterday_of(Utc::now())
    }

    /// Returns the previous calendar day.
    #[must_use]
    pub fn previous(self) -> Self {
        Self(self.0.checked_sub_days(Days::new(1)).unwrap_or(self.0))
    }

    /// Returns the next calendar day.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.checked_add_days(Days::new(1)).unwrap_or(self.0))
    }

    /// Returns the hive path segment (`context_date=YYYY-MM-DD`).
    #[must_use]
    pub fn segment(self) -> String {
        format!("{PARTITION_COLUMN}={self}")
    }

    /// Iterates every date from `self` through `end`, inclusive.
    ///
    /// Yields nothing when `end` is before `self`.
    pub fn through(self, end: Self) -> impl Iterator<Item = Self> {
        let mut cursor = Some(self);
        std::iter::from_fn(move || {
            let current = cursor?;
            if current > end {
                return None;
            }
            cursor = (current < end).then(|| current.next());
            Some(current)
        })
    }
}

impl fmt::Display for ContextDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for ContextDate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // NaiveDate accepts unpadded fields; the key format does not.
        if trimmed.len() != 10 {
            return Err(Error::InvalidInput(format!(
                "context date must be YYYY-MM-DD, got {s:?}"
            )));
        }
        NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("context date must be YYYY-MM-DD, got {s:?}: {e}")))
    }
}

impl Serialize for ContextDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContextDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
