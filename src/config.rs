//! Server Configuration
//!
//! Settings are held in an explicitly constructed [`ServerConfig`] that is
//! passed by reference to the components built from it. There is no global
//! instance, so tests can run several configurations side by side.
//!
//! The text format is the familiar redis.conf style: one `key value` pair per
//! line, `#` starts a comment, keys are case-insensitive.
//!
//! ```text
//! # emberkv.conf
//! databases 16
//! lock-stripes 1024
//! timewheel-interval-ms 10
//! ```
//!
//! Keys this core does not own (`port`, `appendonly`, ...) are skipped with a
//! warning so one file can configure the whole server.

use crate::storage::TimeWheelConfig;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// A known key appeared without a value
    #[error("line {line}: '{key}' requires a value")]
    MissingValue { line: usize, key: String },

    /// A value could not be parsed
    #[error("line {line}: invalid value '{value}' for '{key}'")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    /// A count or interval that must be positive was zero
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
}

/// Settings for the storage core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Number of logical databases (default: 16)
    pub databases: usize,

    /// Lock stripes per database (default: 1024)
    pub lock_stripes: usize,

    /// Shards in each database's entry and version maps (default: 1024)
    pub data_dict_shards: usize,

    /// Shards in each database's expiration map (default: 256)
    pub ttl_dict_shards: usize,

    /// Time wheel tick (default: 10ms)
    pub wheel_interval: Duration,

    /// Time wheel slots per revolution (default: 1024)
    pub wheel_slots: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            databases: 16,
            lock_stripes: 1024,
            data_dict_shards: 1024,
            ttl_dict_shards: 256,
            wheel_interval: Duration::from_millis(10),
            wheel_slots: 1024,
        }
    }
}

impl ServerConfig {
    /// Parses redis.conf-style text on top of the defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (number, raw) in text.lines().enumerate() {
            let line = number + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            let mut parts = content.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default().to_ascii_lowercase();
            let value = parts.next().map(str::trim).unwrap_or_default();

            match key.as_str() {
                "databases" => config.databases = parse_value(line, &key, value)?,
                "lock-stripes" => config.lock_stripes = parse_value(line, &key, value)?,
                "data-dict-shards" => config.data_dict_shards = parse_value(line, &key, value)?,
                "ttl-dict-shards" => config.ttl_dict_shards = parse_value(line, &key, value)?,
                "timewheel-interval-ms" => {
                    config.wheel_interval = Duration::from_millis(parse_value(line, &key, value)?)
                }
                "timewheel-slots" => config.wheel_slots = parse_value(line, &key, value)?,
                _ => warn!(line, key = %key, "Ignoring config key not used by the storage core"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Rejects settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("databases", self.databases),
            ("lock-stripes", self.lock_stripes),
            ("data-dict-shards", self.data_dict_shards),
            ("ttl-dict-shards", self.ttl_dict_shards),
            ("timewheel-slots", self.wheel_slots),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.wheel_interval.is_zero() {
            return Err(ConfigError::Zero("timewheel-interval-ms"));
        }
        Ok(())
    }

    /// Time wheel settings derived from this config.
    pub fn time_wheel(&self) -> TimeWheelConfig {
        TimeWheelConfig {
            interval: self.wheel_interval,
            slots: self.wheel_slots,
        }
    }
}

fn parse_value<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingValue {
            line,
            key: key.to_string(),
        });
    }
    value.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.databases, 16);
        assert!(config.validate().is_ok());
        assert_eq!(config.time_wheel().slots, 1024);
    }

    #[test]
    fn test_parse_overrides() {
        let config = ServerConfig::parse(
            "# storage core\n\
             databases 4\n\
             LOCK-STRIPES 64   # shared stripes\n\
             timewheel-interval-ms 5\n\
             port 6379\n",
        )
        .unwrap();

        assert_eq!(config.databases, 4);
        assert_eq!(config.lock_stripes, 64);
        assert_eq!(config.wheel_interval, Duration::from_millis(5));
        assert_eq!(config.data_dict_shards, 1024);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ServerConfig::parse("databases many"),
            Err(ConfigError::InvalidValue { line: 1, .. })
        ));
        assert!(matches!(
            ServerConfig::parse("\nlock-stripes"),
            Err(ConfigError::MissingValue { line: 2, .. })
        ));
        assert!(matches!(
            ServerConfig::parse("databases 0"),
            Err(ConfigError::Zero("databases"))
        ));
        assert!(matches!(
            ServerConfig::parse("timewheel-interval-ms 0"),
            Err(ConfigError::Zero("timewheel-interval-ms"))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::from_file("/definitely/not/here.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
