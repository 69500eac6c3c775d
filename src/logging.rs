//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level so a single run can
//! be made more verbose without editing the config file.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::ConfigError;

/// Filter from `RUST_LOG`, falling back to `config.level`
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            ConfigError::Invalid(format!("logging.level '{}': {}", config.level, e))
        }),
    }
}

/// Install the global subscriber
///
/// Fails if the level is not a valid filter directive or a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ConfigError::Invalid(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "rollup_store=loud".to_string(),
            json: false,
        };
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn test_directive_level_accepted() {
        let config = LoggingConfig {
            level: "warn,rollup_store=debug".to_string(),
            json: true,
        };
        assert!(build_filter(&config).is_ok());
    }
}
