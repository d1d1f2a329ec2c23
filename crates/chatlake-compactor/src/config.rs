//! Compactor configuration.
//!
//! Built from defaults, then `CHATLAKE_*` environment variables, then
//! command-line overrides. Validation runs once, on the final layering:
//! callers that add their own overrides load with
//! [`CompactorConfig::from_env_unvalidated`] and call
//! [`CompactorConfig::validate`] themselves.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use chatlake_core::{StorageLayout, DEFAULT_LEASE_TTL};

use crate::error::{CompactionError, Result};

/// Tunables for a compaction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorConfig {
    /// Prefix under which raw events are bucketed.
    pub raw_prefix: String,
    /// Prefix under which compacted partitions are published.
    pub output_prefix: String,
    /// Maximum raw objects read and flattened concurrently.
    pub read_concurrency: usize,
    /// Timeout for each list/get/put call, in seconds.
    pub io_timeout_secs: u64,
    /// Budget for a whole run, in seconds.
    pub run_timeout_secs: u64,
    /// Partition lease TTL, in seconds. Must outlast the run budget.
    pub lease_ttl_secs: u64,
    /// Attempts to take a busy lease before failing.
    pub lease_attempts: u32,
    /// Drop rows whose `message_id` was already seen in the bucket.
    pub dedupe: bool,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        let layout = StorageLayout::default();
        Self {
            raw_prefix: layout.raw_prefix().to_string(),
            output_prefix: layout.output_prefix().to_string(),
            read_concurrency: 16,
            io_timeout_secs: 30,
            run_timeout_secs: 15 * 60,
            lease_ttl_secs: DEFAULT_LEASE_TTL.as_secs(),
            lease_attempts: 1,
            dedupe: false,
        }
    }
}

impl CompactorConfig {
    /// Loads configuration from the environment on top of the defaults. The
    /// result is not validated.
    ///
    /// # Environment Variables
    ///
    /// - `CHATLAKE_RAW_PREFIX`, `CHATLAKE_OUTPUT_PREFIX`
    /// - `CHATLAKE_READ_CONCURRENCY`
    /// - `CHATLAKE_IO_TIMEOUT_SECS`, `CHATLAKE_RUN_TIMEOUT_SECS`
    /// - `CHATLAKE_LEASE_TTL_SECS`, `CHATLAKE_LEASE_ATTEMPTS`
    /// - `CHATLAKE_DEDUPE`
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed.
    pub fn from_env_unvalidated() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Applies `CHATLAKE_*` values from `lookup` on top of the defaults.
    ///
    /// Values are trimmed; empty values are ignored. The result is not
    /// validated.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |name: &str| {
            lookup(name).and_then(|v| {
                let trimmed = v.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
        };

        let mut config = Self::default();
        if let Some(prefix) = env("CHATLAKE_RAW_PREFIX") {
            config.raw_prefix = prefix;
        }
        if let Some(prefix) = env("CHATLAKE_OUTPUT_PREFIX") {
            config.output_prefix = prefix;
        }
        if let Some(v) = env("CHATLAKE_READ_CONCURRENCY") {
            config.read_concurrency = parse_num("CHATLAKE_READ_CONCURRENCY", &v)?;
        }
        if let Some(v) = env("CHATLAKE_IO_TIMEOUT_SECS") {
            config.io_timeout_secs = parse_num("CHATLAKE_IO_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = env("CHATLAKE_RUN_TIMEOUT_SECS") {
            config.run_timeout_secs = parse_num("CHATLAKE_RUN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = env("CHATLAKE_LEASE_TTL_SECS") {
            config.lease_ttl_secs = parse_num("CHATLAKE_LEASE_TTL_SECS", &v)?;
        }
        if let Some(v) = env("CHATLAKE_LEASE_ATTEMPTS") {
            config.lease_attempts = parse_num("CHATLAKE_LEASE_ATTEMPTS", &v)?;
        }
        if let Some(v) = env("CHATLAKE_DEDUPE") {
            config.dedupe = parse_bool("CHATLAKE_DEDUPE", &v)?;
        }
        Ok(config)
    }

    /// Checks invariants between settings.
    ///
    /// # Errors
    ///
    /// Returns [`CompactionError::InvalidInput`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.read_concurrency == 0 {
            return Err(invalid("read_concurrency must be at least 1"));
        }
        if self.io_timeout_secs == 0 || self.run_timeout_secs == 0 {
            return Err(invalid("timeouts must be positive"));
        }
        if self.lease_ttl_secs <= self.run_timeout_secs {
            return Err(invalid("lease_ttl_secs must exceed run_timeout_secs"));
        }
        if self.lease_attempts == 0 {
            return Err(invalid("lease_attempts must be at least 1"));
        }
        if self.raw_prefix.trim_matches('/') == self.output_prefix.trim_matches('/') {
            return Err(invalid("raw_prefix and output_prefix must differ"));
        }
        Ok(())
    }

    /// Key layout derived from the prefixes.
    #[must_use]
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.raw_prefix, &self.output_prefix)
    }

    /// Per-call timeout.
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Whole-run budget.
    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Lease TTL.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

fn invalid(message: &str) -> CompactionError {
    CompactionError::InvalidInput(message.to_string())
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| CompactionError::InvalidInput(format!("{name} must be a number: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(CompactionError::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<CompactorConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let config = CompactorConfig::from_lookup(|name| map.get(name).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults_are_valid() {
        let config = CompactorConfig::default();
        config.validate().expect("defaults validate");
        assert!(!config.dedupe);
        assert_eq!(config.layout(), StorageLayout::default());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = from_map(&[
            ("CHATLAKE_RAW_PREFIX", " landing/telegram "),
            ("CHATLAKE_READ_CONCURRENCY", "4"),
            ("CHATLAKE_DEDUPE", "yes"),
            ("CHATLAKE_IO_TIMEOUT_SECS", ""),
        ])
        .expect("valid");
        assert_eq!(config.raw_prefix, "landing/telegram");
        assert_eq!(config.read_concurrency, 4);
        assert!(config.dedupe);
        assert_eq!(config.io_timeout_secs, 30);
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = from_map(&[("CHATLAKE_READ_CONCURRENCY", "many")]).unwrap_err();
        assert!(err.to_string().contains("CHATLAKE_READ_CONCURRENCY"));
        assert!(from_map(&[("CHATLAKE_DEDUPE", "maybe")]).is_err());
    }

    #[test]
    fn lease_must_outlast_run() {
        let err = from_map(&[("CHATLAKE_LEASE_TTL_SECS", "60")]).unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs"));
    }

    #[test]
    fn overrides_apply_before_validation() {
        let vars: HashMap<&str, &str> = [("CHATLAKE_RUN_TIMEOUT_SECS", "3600")].into_iter().collect();
        let mut config = CompactorConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()))
            .expect("loads without validating");
        assert!(config.validate().is_err());

        config.lease_ttl_secs = 7200;
        config.validate().expect("final layering is valid");
        assert_eq!(config.run_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn default_lease_ttl_outlasts_default_run_budget() {
        let config = CompactorConfig::default();
        assert_eq!(config.lease_ttl(), DEFAULT_LEASE_TTL);
        assert!(config.lease_ttl() > config.run_timeout());
    }

    #[test]
    fn prefixes_must_differ() {
        let config = CompactorConfig {
            output_prefix: "/raw/messages/".into(),
            ..CompactorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
