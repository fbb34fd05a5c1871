//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/sluice/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/sluice/` (~/.config/sluice/)
//! - Data: `$XDG_DATA_HOME/sluice/` (~/.local/share/sluice/) — durable queue
//! - State/Logs: `$XDG_STATE_HOME/sluice/` (~/.local/state/sluice/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Collection endpoint URLs
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Retry budget and backoff seed
    #[serde(default)]
    pub retry: RetrySection,

    /// Periodic flush tuning
    #[serde(default)]
    pub flush: FlushConfig,

    /// Reachability detector tuning
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Durable queue tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collection endpoints, consumed not produced by this library.
///
/// The alternative path exists because it is less likely to be
/// pattern-matched by blocklists than the primary one.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Canonical collection endpoint
    #[serde(default = "default_primary_url")]
    pub primary_url: String,

    /// Secondary collection endpoint tried first by the delivery chain
    #[serde(default = "default_alternative_url")]
    pub alternative_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            alternative_url: default_alternative_url(),
        }
    }
}

fn default_primary_url() -> String {
    "http://localhost:3000/api/analytics/events".to_string()
}

fn default_alternative_url() -> String {
    "http://localhost:3000/api/metrics/collect".to_string()
}

/// Retry configuration section
#[derive(Debug, Deserialize, Clone)]
pub struct RetrySection {
    /// Retry budget before an event is excluded from automatic delivery
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff seed in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

/// Periodic flush configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FlushConfig {
    /// Seconds between automatic flush passes
    #[serde(default = "default_flush_interval_secs")]
    pub interval_secs: u64,

    /// Max stored events drained per flush pass
    #[serde(default = "default_flush_batch_size")]
    pub batch_size: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_flush_interval_secs(),
            batch_size: default_flush_batch_size(),
        }
    }
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_flush_batch_size() -> usize {
    50
}

/// Reachability detector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    /// Seconds a cached detection result stays valid
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Probe request timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl DetectorConfig {
    /// Cache TTL as a `Duration`
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Probe timeout as a `Duration`
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    5
}

/// Durable queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Max events retained; overflow evicts oldest first
    #[serde(default = "default_queue_max_events")]
    pub max_events: usize,

    /// Override path for the queue database file
    pub path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_events: default_queue_max_events(),
            path: None,
        }
    }
}

fn default_queue_max_events() -> usize {
    1000
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.primary_url.is_empty() {
            return Err(Error::Config("endpoints.primary_url must not be empty".to_string()));
        }
        if self.endpoints.alternative_url.is_empty() {
            return Err(Error::Config(
                "endpoints.alternative_url must not be empty".to_string(),
            ));
        }
        if self.flush.batch_size == 0 {
            return Err(Error::Config("flush.batch_size must be at least 1".to_string()));
        }
        if self.queue.max_events == 0 {
            return Err(Error::Config("queue.max_events must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/sluice/config.toml` (~/.config/sluice/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("sluice").join("config.toml")
    }

    /// Returns the data directory path (for the queue database)
    ///
    /// `$XDG_DATA_HOME/sluice/` (~/.local/share/sluice/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("sluice")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/sluice/` (~/.local/state/sluice/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("sluice")
    }

    /// Returns the durable queue database path
    ///
    /// Honors `queue.path` when set; otherwise
    /// `$XDG_DATA_HOME/sluice/analytics_events.db`
    pub fn queue_path(&self) -> PathBuf {
        self.queue
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("analytics_events.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.flush.interval_secs, 30);
        assert_eq!(config.flush.batch_size, 50);
        assert_eq!(config.detector.cache_ttl_secs, 300);
        assert_eq!(config.queue.max_events, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[endpoints]
primary_url = "https://shop.example.com/api/analytics/events"
alternative_url = "https://shop.example.com/api/metrics/collect"

[retry]
max_retries = 3
initial_delay_ms = 500

[flush]
interval_secs = 10

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.endpoints.primary_url,
            "https://shop.example.com/api/analytics/events"
        );
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 500);
        assert_eq!(config.flush.interval_secs, 10);
        // Unset sections keep defaults
        assert_eq!(config.flush.batch_size, 50);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_empty_endpoint() {
        let toml = r#"
[endpoints]
primary_url = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let toml = r#"
[flush]
batch_size = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_path_override() {
        let toml = r#"
[queue]
path = "/tmp/custom/events.db"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.queue_path(), PathBuf::from("/tmp/custom/events.db"));
    }
}
