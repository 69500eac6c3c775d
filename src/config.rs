//! Configuration management
//!
//! Configuration is read from a TOML file, then `ROLLUP_*` environment
//! variables override individual values. Every section has defaults, so an
//! empty file is a valid configuration.
//!
//! ```toml
//! [store]
//! supported_periods = ["hourly", "daily", "monthly", "yearly"]
//! max_lock_retries = 5
//!
//! [lock]
//! kind = "shared"
//! ttl_secs = 120
//!
//! [redis]
//! enabled = true
//! url = "redis://127.0.0.1:6379"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::fail_fast::FailFastConfig;
use crate::ingestion::IngestConfig;
use crate::lock::{LockConfig, LockKind};
use crate::redis::RedisConfig;
use crate::services::WatchDogConfig;
use crate::storage::{BufferConfig, StoreConfig};
use crate::types::Period;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Tiers and write protocol
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-entity lock
    #[serde(default)]
    pub lock: LockConfig,

    /// Circuit breaker backoff
    #[serde(default)]
    pub fail_fast: FailFastConfig,

    /// Watchdog tick
    #[serde(default)]
    pub watchdog: WatchDogConfig,

    /// Optional write buffer
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Redis backend
    #[serde(default)]
    pub redis: RedisConfig,

    /// Ingest worker
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Level or filter directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `ROLLUP_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Store
        if let Some(periods) = var("ROLLUP_SUPPORTED_PERIODS") {
            self.store.supported_periods = parse_periods(&periods)?;
        }
        if let Some(retries) = var("ROLLUP_MAX_LOCK_RETRIES") {
            self.store.max_lock_retries = parse_number("ROLLUP_MAX_LOCK_RETRIES", &retries)?;
        }

        // Lock
        if let Some(kind) = var("ROLLUP_LOCK_KIND") {
            self.lock.kind = match kind.trim().to_ascii_lowercase().as_str() {
                "local" => LockKind::Local,
                "shared" => LockKind::Shared,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "ROLLUP_LOCK_KIND must be 'local' or 'shared', got '{}'",
                        other
                    )))
                },
            };
        }
        if let Some(ttl) = var("ROLLUP_LOCK_TTL_SECS") {
            self.lock.ttl_secs = parse_number("ROLLUP_LOCK_TTL_SECS", &ttl)?;
        }

        // Breaker and watchdog
        if let Some(ms) = var("ROLLUP_FAIL_FAST_INITIAL_MS") {
            self.fail_fast.initial_backoff_ms = parse_number("ROLLUP_FAIL_FAST_INITIAL_MS", &ms)?;
        }
        if let Some(ms) = var("ROLLUP_FAIL_FAST_MAX_MS") {
            self.fail_fast.max_backoff_ms = parse_number("ROLLUP_FAIL_FAST_MAX_MS", &ms)?;
        }
        if let Some(ms) = var("ROLLUP_WATCHDOG_INTERVAL_MS") {
            self.watchdog.interval_ms = parse_number("ROLLUP_WATCHDOG_INTERVAL_MS", &ms)?;
        }

        // Buffer
        if let Some(enabled) = var("ROLLUP_BUFFER_ENABLED") {
            self.buffer.enabled = parse_bool("ROLLUP_BUFFER_ENABLED", &enabled)?;
        }
        if let Some(ms) = var("ROLLUP_BUFFER_GRANULARITY_MS") {
            self.buffer.granularity_ms = parse_number("ROLLUP_BUFFER_GRANULARITY_MS", &ms)?;
        }

        // Redis
        if let Some(url) = var("ROLLUP_REDIS_URL") {
            self.redis.url = url;
            self.redis.enabled = true;
        }
        if let Some(enabled) = var("ROLLUP_REDIS_ENABLED") {
            self.redis.enabled = parse_bool("ROLLUP_REDIS_ENABLED", &enabled)?;
        }

        // Logging
        if let Some(level) = var("ROLLUP_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = var("ROLLUP_LOG_JSON") {
            self.logging.json = parse_bool("ROLLUP_LOG_JSON", &json)?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.store.supported_periods.is_empty() {
            return invalid("store.supported_periods cannot be empty");
        }
        if self
            .store
            .supported_periods
            .iter()
            .all(|p| matches!(p, Period::Realtime | Period::Forever))
        {
            return invalid("store.supported_periods needs at least one bounded summarized period");
        }
        if self.store.max_lock_retries == 0 {
            return invalid("store.max_lock_retries must be > 0");
        }

        if self.lock.max_wait_ms == 0 {
            return invalid("lock.max_wait_ms must be > 0");
        }
        if self.lock.ttl_secs == 0 {
            return invalid("lock.ttl_secs must be > 0");
        }
        if self.lock.kind == LockKind::Shared && !self.redis.enabled {
            return invalid("lock.kind = \"shared\" requires redis.enabled");
        }

        if self.fail_fast.initial_backoff_ms == 0 {
            return invalid("fail_fast.initial_backoff_ms must be > 0");
        }
        if self.fail_fast.initial_backoff_ms > self.fail_fast.max_backoff_ms {
            return invalid("fail_fast.initial_backoff_ms cannot exceed fail_fast.max_backoff_ms");
        }

        if self.watchdog.interval_ms == 0 {
            return invalid("watchdog.interval_ms must be > 0");
        }
        if self.buffer.granularity_ms == 0 {
            return invalid("buffer.granularity_ms must be > 0");
        }
        if self.ingest.channel_capacity == 0 {
            return invalid("ingest.channel_capacity must be > 0");
        }

        if self.redis.enabled {
            self.redis.validate().map_err(ConfigError::Invalid)?;
        }

        Ok(())
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

fn parse_periods(raw: &str) -> Result<Vec<Period>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Period>()
                .map_err(|e| ConfigError::Invalid(format!("ROLLUP_SUPPORTED_PERIODS: {}", e)))
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} must be a number, got '{}'", name, raw)))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!(
            "{} must be a boolean, got '{}'",
            name, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.store.supported_periods,
            vec![Period::Hourly, Period::Daily, Period::Monthly, Period::Yearly]
        );
        assert_eq!(config.store.max_lock_retries, 5);
        assert_eq!(config.lock.kind, LockKind::Local);
        assert_eq!(config.lock.ttl_secs, 120);
        assert_eq!(config.fail_fast.initial_backoff_ms, 1000);
        assert_eq!(config.watchdog.interval_ms, 1000);
        assert!(!config.buffer.enabled);
        assert!(!config.redis.enabled);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [store]
            supported_periods = ["fifteen_minute", "daily"]

            [lock]
            kind = "shared"

            [redis]
            enabled = true
            url = "redis://cache:6379"

            [logging]
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config.store.supported_periods,
            vec![Period::FifteenMinute, Period::Daily]
        );
        assert_eq!(config.store.max_lock_retries, 5);
        assert_eq!(config.lock.kind, LockKind::Shared);
        assert_eq!(config.redis.url, "redis://cache:6379");
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_period_rejected() {
        let err = Config::from_toml_str("[store]\nsupported_periods = [\"fortnightly\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_realtime_only_rejected() {
        let mut config = Config::default();
        config.store.supported_periods = vec![Period::Realtime];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_forever_only_rejected() {
        let err = Config::from_toml_str("[store]\nsupported_periods = [\"forever\"]")
            .and_then(|config| config.validate())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = Config::default();
        config.store.supported_periods = vec![Period::Forever, Period::Daily];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = Config::default();
        config.watchdog.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.buffer.granularity_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_ordering_rejected() {
        let mut config = Config::default();
        config.fail_fast.initial_backoff_ms = 60_000;
        config.fail_fast.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_url_required_when_enabled() {
        let mut config = Config::default();
        config.redis.enabled = true;
        config.redis.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_lock_requires_redis() {
        let mut config = Config::default();
        config.lock.kind = LockKind::Shared;
        assert!(config.validate().is_err());

        config.redis.enabled = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(overrides(&[
                ("ROLLUP_SUPPORTED_PERIODS", "hourly, weekly"),
                ("ROLLUP_LOCK_KIND", "Shared"),
                ("ROLLUP_REDIS_URL", "redis://other:6380"),
                ("ROLLUP_LOG_LEVEL", "debug"),
                ("ROLLUP_BUFFER_ENABLED", "yes"),
                ("ROLLUP_MAX_LOCK_RETRIES", "9"),
            ]))
            .unwrap();

        assert_eq!(
            config.store.supported_periods,
            vec![Period::Hourly, Period::Weekly]
        );
        assert_eq!(config.lock.kind, LockKind::Shared);
        assert!(config.redis.enabled);
        assert_eq!(config.redis.url, "redis://other:6380");
        assert_eq!(config.logging.level, "debug");
        assert!(config.buffer.enabled);
        assert_eq!(config.store.max_lock_retries, 9);
    }

    #[test]
    fn test_bad_env_override() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(overrides(&[("ROLLUP_SUPPORTED_PERIODS", "hourly,sometimes")]))
            .is_err());
        assert!(config
            .apply_overrides(overrides(&[("ROLLUP_LOCK_KIND", "distributed")]))
            .is_err());
        assert!(config
            .apply_overrides(overrides(&[("ROLLUP_WATCHDOG_INTERVAL_MS", "soon")]))
            .is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[watchdog]\ninterval_ms = 250").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.watchdog.interval_ms, 250);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.buffer.enabled = true;
        config.store.supported_periods = vec![Period::Minutely, Period::Hourly];

        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }
}
