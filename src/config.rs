//! Configuration file parser for ~/.config/feedsync/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning for each one
//! since they are usually typos.
//!
//! Remote sync credentials are not read from here; they live in the settings
//! table (`feedsync configure-sync`).
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::FetchOptions;
use crate::network::ProbeOptions;
use crate::sync::{BackoffPolicy, ExecutorOptions};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minutes between scheduled fetch cycles in daemon mode. 0 = never.
    pub refresh_interval_minutes: u64,

    /// Minutes between reconciliation cycles in daemon mode. 0 = never.
    pub sync_interval_minutes: u64,

    /// Database location; defaults to `feedsync.db` in the config directory.
    pub database_path: Option<PathBuf>,

    pub fetch: FetchConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_minutes: 30,
            sync_interval_minutes: 15,
            database_path: None,
            fetch: FetchConfig::default(),
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// `[fetch]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-feed timeout, retries included.
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_feed_size_mb: u64,
    pub user_agent: String,
    /// Overrides the measured concurrency recommendation.
    pub max_concurrency: Option<usize>,
    /// Directory for script feeds; defaults to `scripts/` in the config directory.
    pub scripts_dir: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            max_feed_size_mb: 10,
            user_agent: format!("feedsync/{}", env!("CARGO_PKG_VERSION")),
            max_concurrency: None,
            scripts_dir: None,
        }
    }
}

/// `[network]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub probe_endpoints: Vec<String>,
    pub probe_count: usize,
    pub probe_kib: usize,
    pub timeout_secs: u64,
    /// Cached profile older than this is re-measured before a cycle. 0 = never.
    pub remeasure_after_hours: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let probe = ProbeOptions::default();
        Self {
            probe_endpoints: probe.endpoints,
            probe_count: probe.probe_count,
            probe_kib: probe.probe_bytes / 1024,
            timeout_secs: probe.timeout.as_secs(),
            remeasure_after_hours: 24,
        }
    }
}

/// `[sync]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub push_timeout_secs: u64,
    pub pull_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_multiplier: u32,
    pub backoff_cap_secs: u64,
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let executor = ExecutorOptions::default();
        Self {
            batch_size: executor.batch_size,
            push_timeout_secs: executor.push_timeout.as_secs(),
            pull_timeout_secs: executor.pull_timeout.as_secs(),
            backoff_base_secs: executor.backoff.base.as_secs(),
            backoff_multiplier: executor.backoff.multiplier,
            backoff_cap_secs: executor.backoff.cap.as_secs(),
            max_attempts: executor.max_attempts,
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "refresh_interval_minutes",
    "sync_interval_minutes",
    "database_path",
    "fetch",
    "network",
    "sync",
];
const FETCH_KEYS: &[&str] = &[
    "timeout_secs",
    "max_retries",
    "retry_base_delay_ms",
    "max_feed_size_mb",
    "user_agent",
    "max_concurrency",
    "scripts_dir",
];
const NETWORK_KEYS: &[&str] = &[
    "probe_endpoints",
    "probe_count",
    "probe_kib",
    "timeout_secs",
    "remeasure_after_hours",
];
const SYNC_KEYS: &[&str] = &[
    "batch_size",
    "push_timeout_secs",
    "pull_timeout_secs",
    "backoff_base_secs",
    "backoff_multiplier",
    "backoff_cap_secs",
    "max_attempts",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading a corrupted or huge file into memory
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            refresh_minutes = config.refresh_interval_minutes,
            sync_minutes = config.sync_interval_minutes,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Fetch tunables, with `config_dir` as the base for relative defaults.
    pub fn fetch_options(&self, config_dir: &Path) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_secs(self.fetch.timeout_secs.max(1)),
            max_retries: self.fetch.max_retries,
            retry_base_delay: Duration::from_millis(self.fetch.retry_base_delay_ms),
            max_feed_size: usize::try_from(self.fetch.max_feed_size_mb.max(1))
                .unwrap_or(usize::MAX / (1024 * 1024))
                .saturating_mul(1024 * 1024),
            scripts_dir: self
                .fetch
                .scripts_dir
                .clone()
                .unwrap_or_else(|| config_dir.join("scripts")),
            user_agent: self.fetch.user_agent.clone(),
        }
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            endpoints: self.network.probe_endpoints.clone(),
            probe_count: self.network.probe_count.max(1),
            probe_bytes: self.network.probe_kib.max(1).saturating_mul(1024),
            timeout: Duration::from_secs(self.network.timeout_secs.max(1)),
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            batch_size: self.sync.batch_size.max(1),
            push_timeout: Duration::from_secs(self.sync.push_timeout_secs.max(1)),
            pull_timeout: Duration::from_secs(self.sync.pull_timeout_secs.max(1)),
            backoff: BackoffPolicy {
                base: Duration::from_secs(self.sync.backoff_base_secs),
                multiplier: self.sync.backoff_multiplier.max(1),
                cap: Duration::from_secs(self.sync.backoff_cap_secs),
            },
            max_attempts: self.sync.max_attempts.max(1),
        }
    }

    /// Maximum age of a cached network profile, `None` = never re-measure.
    pub fn remeasure_after(&self) -> Option<Duration> {
        match self.network.remeasure_after_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours.saturating_mul(3600))),
        }
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    for (section, known) in [("fetch", FETCH_KEYS), ("network", NETWORK_KEYS), ("sync", SYNC_KEYS)] {
        if let Some(toml::Value::Table(table)) = raw.get(section) {
            for key in table.keys() {
                if !known.contains(&key.as_str()) {
                    tracing::warn!(section = section, key = %key, "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.refresh_interval_minutes, 30);
        assert_eq!(config.sync_interval_minutes, 15);
        assert!(config.database_path.is_none());
        assert_eq!(config.sync.backoff_base_secs, 30);
        assert_eq!(config.sync.backoff_multiplier, 2);
        assert_eq!(config.sync.backoff_cap_secs, 3600);
        assert_eq!(config.sync.max_attempts, 50);
        assert!(config.fetch.max_concurrency.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedsync_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = std::env::temp_dir().join("feedsync_config_test_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "   \n  \n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = Config::parse("[sync]\nmax_attempts = 5\n").unwrap();
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.batch_size, SyncConfig::default().batch_size);
        assert_eq!(config.fetch, FetchConfig::default());
    }

    #[test]
    fn test_full_config() {
        let content = r#"
refresh_interval_minutes = 60
sync_interval_minutes = 5
database_path = "/var/lib/feedsync/db.sqlite"

[fetch]
timeout_secs = 10
max_retries = 1
retry_base_delay_ms = 250
max_feed_size_mb = 2
user_agent = "custom/1.0"
max_concurrency = 4
scripts_dir = "/opt/feed-scripts"

[network]
probe_endpoints = ["https://probe.example.com/blob"]
probe_count = 2
probe_kib = 64
timeout_secs = 5
remeasure_after_hours = 0

[sync]
batch_size = 20
push_timeout_secs = 3
pull_timeout_secs = 30
backoff_base_secs = 10
backoff_multiplier = 3
backoff_cap_secs = 600
max_attempts = 7
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(config.refresh_interval_minutes, 60);
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/feedsync/db.sqlite"))
        );

        let fetch = config.fetch_options(Path::new("/home/u/.config/feedsync"));
        assert_eq!(fetch.timeout, Duration::from_secs(10));
        assert_eq!(fetch.retry_base_delay, Duration::from_millis(250));
        assert_eq!(fetch.max_feed_size, 2 * 1024 * 1024);
        assert_eq!(fetch.scripts_dir, PathBuf::from("/opt/feed-scripts"));
        assert_eq!(config.fetch.max_concurrency, Some(4));

        let probe = config.probe_options();
        assert_eq!(probe.endpoints, vec!["https://probe.example.com/blob".to_string()]);
        assert_eq!(probe.probe_bytes, 64 * 1024);
        assert!(config.remeasure_after().is_none());

        let executor = config.executor_options();
        assert_eq!(executor.batch_size, 20);
        assert_eq!(
            executor.backoff,
            BackoffPolicy {
                base: Duration::from_secs(10),
                multiplier: 3,
                cap: Duration::from_secs(600),
            }
        );
        assert_eq!(executor.max_attempts, 7);
    }

    #[test]
    fn test_scripts_dir_defaults_under_config_dir() {
        let fetch = Config::default().fetch_options(Path::new("/cfg"));
        assert_eq!(fetch.scripts_dir, PathBuf::from("/cfg/scripts"));
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let config = Config::parse("[sync]\nbatch_size = 0\nmax_attempts = 0\n[fetch]\ntimeout_secs = 0\n").unwrap();
        assert_eq!(config.executor_options().batch_size, 1);
        assert_eq!(config.executor_options().max_attempts, 1);
        assert_eq!(config.fetch_options(Path::new("/")).timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::parse("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let content = r#"
refresh_interval_minutes = 10
totally_fake_key = "should not fail"

[sync]
not_a_sync_key = 1
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(config.refresh_interval_minutes, 10);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::parse("refresh_interval_minutes = \"soon\"\n").is_err());
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("feedsync_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
