//! Configuration management
//!
//! TOML configuration with environment variable overrides and sensible
//! defaults. Every section may be omitted from the file.
//!
//! ```toml
//! [redis]
//! url = "redis://127.0.0.1:6379"
//! command_timeout_ms = 1000
//!
//! [engine]
//! key_prefix = "bitesized"
//! intervals = ["day", "week", "month"]
//!
//! [logging]
//! level = "info"
//! ```

use crate::interval::{Granularity, IntervalCatalog};
use crate::keys::{validate_prefix, DEFAULT_KEY_PREFIX};
use crate::redis::{ConnectBackoff, RedisConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisSettings,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisSettings {
    /// Server URL (`redis://` or `rediss://`)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Maximum in-flight commands
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Per-command deadline in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Extra connect attempts before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Use TLS (requires the `redis-tls` feature)
    #[serde(default)]
    pub tls_enabled: bool,
}

/// Engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Namespace prefix of every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Granularities written by every record call
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Granularity>,

    /// Scratch key lifetime in seconds (0 = no expiry)
    #[serde(default = "default_scratch_ttl_secs")]
    pub scratch_ttl_secs: u64,

    /// Users kept in the local offset cache
    #[serde(default = "default_offset_cache_capacity")]
    pub offset_cache_capacity: usize,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive (error, warn, info, debug, trace or a full EnvFilter)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

// Default value functions
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_pool_size() -> u32 { 16 }
fn default_connection_timeout_ms() -> u64 { 5_000 }
fn default_command_timeout_ms() -> u64 { 1_000 }
fn default_connect_retries() -> u32 { 3 }
fn default_key_prefix() -> String { DEFAULT_KEY_PREFIX.to_string() }
fn default_intervals() -> Vec<Granularity> { IntervalCatalog::default().granularities().to_vec() }
fn default_scratch_ttl_secs() -> u64 { 60 }
fn default_offset_cache_capacity() -> usize { 100_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_retries: default_connect_retries(),
            tls_enabled: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            intervals: default_intervals(),
            scratch_ttl_secs: default_scratch_ttl_secs(),
            offset_cache_capacity: default_offset_cache_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl RedisSettings {
    /// Connection pool configuration for these settings
    pub fn to_redis_config(&self) -> RedisConfig {
        RedisConfig::with_url(self.url.clone())
            .pool_size(self.pool_size)
            .connection_timeout(Duration::from_millis(self.connection_timeout_ms))
            .command_timeout(Duration::from_millis(self.command_timeout_ms))
            .connect_backoff(ConnectBackoff {
                max_retries: self.connect_retries,
                ..Default::default()
            })
            .tls(self.tls_enabled)
    }
}

impl EngineConfig {
    /// Interval catalog built from `intervals`
    pub fn catalog(&self) -> crate::Result<IntervalCatalog> {
        IntervalCatalog::new(self.intervals.clone())
    }

    /// Scratch key TTL, `None` when disabled
    pub fn scratch_ttl(&self) -> Option<Duration> {
        match self.scratch_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        // Redis
        if let Ok(url) = std::env::var("BITESIZED_REDIS_URL") {
            self.redis.url = url;
        }

        // Engine
        if let Ok(prefix) = std::env::var("BITESIZED_KEY_PREFIX") {
            self.engine.key_prefix = prefix;
        }
        if let Ok(intervals) = std::env::var("BITESIZED_INTERVALS") {
            match IntervalCatalog::parse_list(&intervals) {
                Ok(catalog) => self.engine.intervals = catalog.granularities().to_vec(),
                Err(e) => tracing::warn!("Ignoring BITESIZED_INTERVALS={}: {}", intervals, e),
            }
        }

        // Logging
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.redis.to_redis_config().validate()?;

        if self.redis.connection_timeout_ms == 0 {
            return Err("Connection timeout must be > 0".to_string());
        }

        validate_prefix(&self.engine.key_prefix).map_err(|e| e.to_string())?;

        if self.engine.intervals.is_empty() {
            return Err("At least one interval must be configured".to_string());
        }
        self.engine.catalog().map_err(|e| e.to_string())?;

        if self.logging.level.trim().is_empty() {
            return Err("Log level cannot be empty".to_string());
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.engine.key_prefix, "bitesized");
        assert_eq!(
            config.engine.intervals,
            vec![
                Granularity::Hour,
                Granularity::Day,
                Granularity::Week,
                Granularity::Month,
                Granularity::Year
            ]
        );
        assert_eq!(config.engine.scratch_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_settings() {
        let mut config = Config::default();
        config.engine.intervals.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.intervals = vec![Granularity::Day, Granularity::Day];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.key_prefix = "has space".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.redis.command_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            intervals = ["day", "all"]
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.intervals, vec![Granularity::Day, Granularity::All]);
        assert_eq!(config.engine.key_prefix, "bitesized");
        assert_eq!(config.redis.pool_size, 16);
    }

    #[test]
    fn test_unknown_granularity_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [engine]
            intervals = ["fortnight"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_redis_config_conversion() {
        let settings = RedisSettings {
            command_timeout_ms: 250,
            connect_retries: 0,
            ..Default::default()
        };
        let redis = settings.to_redis_config();
        assert_eq!(redis.command_timeout, Duration::from_millis(250));
        assert_eq!(redis.backoff.max_retries, 0);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("BITESIZED_KEY_PREFIX", "tenant-7");
        std::env::set_var("BITESIZED_INTERVALS", "day, week");
        let config = Config::from_env();
        assert_eq!(config.engine.key_prefix, "tenant-7");
        assert_eq!(config.engine.intervals, vec![Granularity::Day, Granularity::Week]);

        std::env::set_var("BITESIZED_INTERVALS", "day,fortnight");
        let config = Config::from_env();
        assert_eq!(config.engine.intervals, default_intervals());

        std::env::remove_var("BITESIZED_KEY_PREFIX");
        std::env::remove_var("BITESIZED_INTERVALS");
    }
}
