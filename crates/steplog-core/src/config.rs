//! Configuration for the tick engine.
//!
//! [`LogConfig`] is usually embedded in an application's YAML file under a
//! `log:` key, but it can also be loaded on its own. Every field has a
//! default, so an empty document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Where rendered watch lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchOutput {
    /// Print to standard output.
    #[default]
    Stdout,
    /// Emit as an `info` event on the `steplog::watch` target.
    Log,
    /// Keep only the last report in memory.
    Silent,
}

/// Tick engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogConfig {
    /// Metadata operations (constants, registrations) between commits.
    #[serde(default = "default_commit_interval")]
    pub commit_interval: u32,

    /// Target wall-clock seconds between watch prints.
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: f64,

    /// Capture warnings pushed through the sink in writable modes.
    #[serde(default = "default_true")]
    pub capture_warnings: bool,

    /// Capture log events through the sink in writable modes.
    #[serde(default = "default_true")]
    pub capture_logging: bool,

    /// How long a writer waits on another writer's lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Ticks during which every `tick_before` flushes the store.
    #[serde(default = "default_early_flush_ticks")]
    pub early_flush_ticks: u64,

    /// Seconds between opportunistic flushes.
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: f64,

    /// Seconds between flushes once the run is long.
    #[serde(default = "default_long_run_save_interval_secs")]
    pub long_run_save_interval_secs: f64,

    /// Runtime in seconds after which a run counts as long.
    #[serde(default = "default_long_run_threshold_secs")]
    pub long_run_threshold_secs: f64,

    /// Names tried by the unique-suffix open mode before giving up.
    #[serde(default = "default_unique_suffix_attempts")]
    pub unique_suffix_attempts: u32,

    /// Destination of rendered watch lines.
    #[serde(default)]
    pub watch_output: WatchOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            commit_interval: default_commit_interval(),
            watch_interval_secs: default_watch_interval_secs(),
            capture_warnings: true,
            capture_logging: true,
            busy_timeout_ms: default_busy_timeout_ms(),
            early_flush_ticks: default_early_flush_ticks(),
            save_interval_secs: default_save_interval_secs(),
            long_run_save_interval_secs: default_long_run_save_interval_secs(),
            long_run_threshold_secs: default_long_run_threshold_secs(),
            unique_suffix_attempts: default_unique_suffix_attempts(),
            watch_output: WatchOutput::default(),
        }
    }
}

impl LogConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(yaml)?;
        Ok(config)
    }

    /// The busy timeout as a [`Duration`].
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Flush interval for a run that has been going for `elapsed_secs`.
    pub fn save_interval(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs > self.long_run_threshold_secs {
            self.long_run_save_interval_secs
        } else {
            self.save_interval_secs
        }
    }
}

const fn default_commit_interval() -> u32 {
    90
}

const fn default_watch_interval_secs() -> f64 {
    1.0
}

const fn default_true() -> bool {
    true
}

const fn default_busy_timeout_ms() -> u64 {
    30_000
}

const fn default_early_flush_ticks() -> u64 {
    5
}

const fn default_save_interval_secs() -> f64 {
    15.0
}

const fn default_long_run_save_interval_secs() -> f64 {
    300.0
}

const fn default_long_run_threshold_secs() -> f64 {
    900.0
}

const fn default_unique_suffix_attempts() -> u32 {
    16
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(LogConfig::parse("").unwrap(), LogConfig::default());
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let config = LogConfig::parse(
            "commit_interval: 10\nwatch_interval_secs: 5.0\nwatch_output: silent\n",
        )
        .unwrap();
        assert_eq!(config.commit_interval, 10);
        assert_eq!(config.watch_interval_secs, 5.0);
        assert_eq!(config.watch_output, WatchOutput::Silent);
        assert_eq!(config.busy_timeout_ms, 30_000);
        assert!(config.capture_logging);
    }

    #[test]
    fn save_interval_switches_after_threshold() {
        let config = LogConfig::default();
        assert_eq!(config.save_interval(10.0), 15.0);
        assert_eq!(config.save_interval(1000.0), 300.0);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        assert!(matches!(
            LogConfig::parse("commit_interval: [oops"),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.yaml");
        std::fs::write(&path, "early_flush_ticks: 2\n").unwrap();
        let config = LogConfig::from_file(&path).unwrap();
        assert_eq!(config.early_flush_ticks, 2);
    }
}
