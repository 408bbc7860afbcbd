//! # vnlink Core Library
//!
//! Communication engine for inertial navigation sensors:
//! - Framing and validation of ASCII sentences and binary telemetry packets
//! - Register reads and writes correlated with their responses
//! - A bounded queue of decoded measurements
//! - Multi-processor firmware update over the bootloader protocol
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vnlink_core::{Sensor, SensorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), vnlink_core::Error> {
//!     let mut sensor = Sensor::new(SensorConfig::load_default()?);
//!     let baud = sensor.auto_connect("/dev/ttyUSB0").await?;
//!     println!("sensor at {baud} baud");
//!
//!     while let Some(measurement) = sensor.next_measurement(Duration::from_secs(1)).await {
//!         if let Some(attitude) = &measurement.attitude {
//!             println!("{:?}", attitude.ypr);
//!         }
//!     }
//!
//!     sensor.disconnect().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;
pub mod logging;

// Re-exports for convenience
pub use crate::config::{ConfigError, SensorConfig};
pub use crate::core::command::{CommandError, CommandRequest, SensorError};
pub use crate::core::firmware::{
    FirmwareUpdateError, Processor, ProcessorPaths, UpdateParams, UpdateReport,
};
pub use crate::core::listener::{AsyncError, AsyncListener, ByteSink, DataExporter, ReceivedByteBuffer};
pub use crate::core::measurement::Measurement;
pub use crate::core::protocol::{ChecksumMode, FrameDecoder, RawFrame};
pub use crate::core::register::{BinaryOutputGroup, CodecError, Encoding, Register};
pub use crate::core::sensor::{ConnectionState, Sensor, SensorStats};
pub use crate::core::simulator::SimulatedSensor;
pub use crate::core::transport::{ConnectionError, SerialConfig, SerialTransport, Transport};

use thiserror::Error;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Any error the library returns
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Register encode or decode failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Command failure
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Firmware update failure
    #[error(transparent)]
    Firmware(#[from] FirmwareUpdateError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}
