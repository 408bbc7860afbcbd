//! Sensor settings
//!
//! Every section uses `#[serde(default)]`, so a file only has to name the
//! values it changes. Durations are stored in milliseconds.

use crate::core::dispatcher::DispatchOptions;
use crate::core::firmware::MAX_CHUNK_SIZE;
use crate::core::listener::{DEFAULT_ERROR_QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY};
use crate::core::protocol::ChecksumMode;
use crate::core::transport::is_supported_baud_rate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Config I/O error on {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// TOML could not be parsed
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML could not be produced
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("Invalid config value: {0}")]
    Invalid(String),

    /// No platform configuration directory
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Sensor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Command settings
    pub command: CommandSettings,
    /// Listener settings
    pub listener: ListenerSettings,
    /// Protocol settings
    pub protocol: ProtocolSettings,
    /// Firmware update settings
    pub firmware: FirmwareSettings,
}

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Rates tried in order by auto-connect
    pub auto_connect_baud_rates: Vec<u32>,
    /// Wait for the Model response at each rate
    pub auto_connect_timeout_ms: u64,
    /// Reader sleep when no bytes arrived
    pub poll_interval_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            auto_connect_baud_rates: vec![
                115_200, 921_600, 460_800, 230_400, 128_000, 57600, 38400, 19200, 9600,
            ],
            auto_connect_timeout_ms: 250,
            poll_interval_ms: 1,
        }
    }
}

/// Command settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Wait per attempt
    pub timeout_ms: u64,
    /// Sends before a command times out
    pub attempts: u32,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            attempts: 3,
        }
    }
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Measurements kept before the oldest is dropped
    pub queue_capacity: usize,
    /// Unsolicited sensor errors kept before the oldest is dropped
    pub error_queue_capacity: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            error_queue_capacity: DEFAULT_ERROR_QUEUE_CAPACITY,
        }
    }
}

/// Protocol settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Checksum appended to outgoing sentences
    pub checksum: ChecksumMode,
}

/// Firmware update settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareSettings {
    /// Image bytes per write
    pub chunk_size: usize,
    /// Wait for each bootloader acknowledgement
    pub ack_timeout_ms: u64,
    /// Sends per chunk before the update aborts
    pub chunk_attempts: u32,
    /// Bootloader entry attempts
    pub enter_attempts: u32,
    /// Wait for the image verification result
    pub verify_timeout_ms: u64,
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            ack_timeout_ms: 1000,
            chunk_attempts: 5,
            enter_attempts: 3,
            verify_timeout_ms: 5000,
        }
    }
}

impl FirmwareSettings {
    /// Acknowledgement timeout
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Verification timeout
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

impl SensorConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        super::config_dir().map(|dir| dir.join("sensor.toml"))
    }

    /// Parse and validate TOML
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from the default location, or defaults when no file exists
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check ranges the rest of the crate relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.auto_connect_baud_rates.is_empty() {
            return Err(ConfigError::Invalid("auto_connect_baud_rates is empty".into()));
        }
        if let Some(baud) = self
            .connection
            .auto_connect_baud_rates
            .iter()
            .find(|b| !is_supported_baud_rate(**b))
        {
            return Err(ConfigError::Invalid(format!("unsupported baud rate {baud}")));
        }
        if self.command.attempts == 0 {
            return Err(ConfigError::Invalid("command.attempts must be at least 1".into()));
        }
        if self.listener.queue_capacity == 0 {
            return Err(ConfigError::Invalid("listener.queue_capacity must be at least 1".into()));
        }
        if self.listener.error_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "listener.error_queue_capacity must be at least 1".into(),
            ));
        }
        if self.firmware.chunk_size == 0 || self.firmware.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "firmware.chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if self.firmware.chunk_attempts == 0 || self.firmware.enter_attempts == 0 {
            return Err(ConfigError::Invalid("firmware attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Command options for the dispatcher
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            timeout: Duration::from_millis(self.command.timeout_ms),
            attempts: self.command.attempts,
            checksum: self.protocol.checksum,
        }
    }

    /// Single-attempt options used to try a baud rate
    pub fn baud_search_options(&self) -> DispatchOptions {
        DispatchOptions {
            timeout: Duration::from_millis(self.connection.auto_connect_timeout_ms),
            attempts: 1,
            checksum: self.protocol.checksum,
        }
    }

    /// Reader poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.connection.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = SensorConfig::from_toml_str(
            r#"
            [command]
            timeout_ms = 50

            [protocol]
            checksum = "xor8"
            "#,
        )
        .unwrap();
        assert_eq!(config.command.timeout_ms, 50);
        assert_eq!(config.command.attempts, 3);
        assert_eq!(config.protocol.checksum, ChecksumMode::Xor8);
        assert_eq!(config.listener.queue_capacity, 1000);
        assert_eq!(config.listener.error_queue_capacity, 32);
        assert_eq!(config.connection.auto_connect_baud_rates[0], 115_200);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(SensorConfig::from_toml_str("[command]\nattempts = 0").is_err());
        assert!(SensorConfig::from_toml_str("[connection]\nauto_connect_baud_rates = [1234]").is_err());
        assert!(SensorConfig::from_toml_str("[firmware]\nchunk_size = 100000").is_err());
        assert!(SensorConfig::from_toml_str("[listener]\nerror_queue_capacity = 0").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor.toml");
        let mut config = SensorConfig::default();
        config.firmware.chunk_size = 128;
        config.save(&path).unwrap();
        assert_eq!(SensorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let result = SensorConfig::load("/nonexistent/vnlink/sensor.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
