//! Configuration module
//!
//! Handles sensor connection, command, listener and firmware settings

mod settings;

pub use settings::{
    CommandSettings, ConfigError, ConnectionSettings, FirmwareSettings, ListenerSettings,
    ProtocolSettings, SensorConfig,
};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "vnlink", "vnlink").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the data directory
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "vnlink", "vnlink").map(|dirs| dirs.data_dir().to_path_buf())
}
