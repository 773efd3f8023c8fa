//! Queue configuration.
//!
//! Every option lives at the top level of the TOML document; the nested
//! structs only group them for the component that consumes them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Full configuration for one queue instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between periodic stat logs. Zero disables the stat loop.
    pub stat_interval_sec: u64,
    #[serde(flatten)]
    pub scheduler: SchedulerConfig,
    #[serde(flatten)]
    pub consumer: ConsumerConfig,
    #[serde(flatten)]
    pub store: StoreConfig,
}

/// Scheduler options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of the in-memory near-term queue.
    pub max_scheduled_events: usize,
    /// Retries allowed before an event is given up.
    pub max_retry: u32,
}

/// Consumer and lease options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Owner identity written into claimed rows. Empty means generated.
    pub consumer_name: String,
    pub consumer_lock_timeout_sec: u64,
    pub consumer_time_window_sec: u64,
    pub consumer_select_limit: usize,
    pub consumer_sleep_msec: u64,
}

/// Durable store options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_path: PathBuf,
    pub table_name: String,
    /// Copy terminal rows into `<table>_archive` before deleting them.
    pub archive_terminal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stat_interval_sec: 0,
            scheduler: SchedulerConfig::default(),
            consumer: ConsumerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_scheduled_events: 10_000,
            max_retry: 18,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: String::new(),
            consumer_lock_timeout_sec: 31,
            consumer_time_window_sec: 5,
            consumer_select_limit: 50,
            consumer_sleep_msec: 100,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("kairos.db"),
            table_name: "events".to_string(),
            archive_terminal: false,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` for malformed input and `InvalidConfig` when
    /// a value is out of range.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, otherwise the
    /// errors of [`Config::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&input)
    }

    /// Check that every bounded option is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_scheduled_events == 0 {
            return Err(Error::invalid_config("max_scheduled_events must be > 0"));
        }
        if self.consumer.consumer_lock_timeout_sec == 0 {
            return Err(Error::invalid_config("consumer_lock_timeout_sec must be > 0"));
        }
        if self.consumer.consumer_select_limit == 0 {
            return Err(Error::invalid_config("consumer_select_limit must be > 0"));
        }
        let table = &self.store.table_name;
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::invalid_config(format!(
                "table_name '{table}' must match [A-Za-z0-9_]+"
            )));
        }
        Ok(())
    }

    /// Interval of the periodic stat log, or `None` when disabled.
    #[must_use]
    pub const fn stat_interval(&self) -> Option<Duration> {
        match self.stat_interval_sec {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl ConsumerConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_lock_timeout_sec)
    }

    #[must_use]
    pub const fn time_window(&self) -> Duration {
        Duration::from_secs(self.consumer_time_window_sec)
    }

    #[must_use]
    pub const fn poll_sleep(&self) -> Duration {
        Duration::from_millis(self.consumer_sleep_msec)
    }

    /// Period of the lease-reclaim sweep: a quarter of the lock timeout plus 1ms.
    #[must_use]
    pub const fn reclaim_interval(&self) -> Duration {
        let quarter_ms = self.consumer_lock_timeout_sec.saturating_mul(1000) / 4;
        Duration::from_millis(quarter_ms.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.stat_interval_sec, 0);
        assert_eq!(config.scheduler.max_scheduled_events, 10_000);
        assert_eq!(config.scheduler.max_retry, 18);
        assert_eq!(config.consumer.consumer_lock_timeout_sec, 31);
        assert_eq!(config.consumer.consumer_time_window_sec, 5);
        assert_eq!(config.consumer.consumer_select_limit, 50);
        assert_eq!(config.consumer.consumer_sleep_msec, 100);
        assert_eq!(config.store.table_name, "events");
        assert!(config.consumer.consumer_name.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flat_keys_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            stat_interval_sec = 10
            max_retry = 3
            consumer_lock_timeout_sec = 4
            consumer_name = "worker-1"
            table_name = "delayed"
            "#,
        )
        .unwrap();

        assert_eq!(config.stat_interval(), Some(Duration::from_secs(10)));
        assert_eq!(config.scheduler.max_retry, 3);
        assert_eq!(config.scheduler.max_scheduled_events, 10_000);
        assert_eq!(config.consumer.consumer_name, "worker-1");
        assert_eq!(config.consumer.reclaim_interval(), Duration::from_millis(1001));
        assert_eq!(config.store.table_name, "delayed");
    }

    #[test]
    fn test_zero_stat_interval_disables_loop() {
        assert_eq!(Config::default().stat_interval(), None);
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        let result = Config::from_toml_str(r#"table_name = "events; DROP TABLE x""#);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let result = Config::from_toml_str("max_scheduled_events = 0");
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_malformed_toml() {
        let result = Config::from_toml_str("max_retry = [");
        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kairos.toml");
        std::fs::write(&path, "consumer_sleep_msec = 25\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.consumer.poll_sleep(), Duration::from_millis(25));

        let missing = Config::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(Error::FileReadFailed { .. })));
    }
}
