//! Transport layer
//!
//! A [`Transport`] moves raw bytes to and from the sensor. The serial port is
//! the production implementation; [`crate::core::simulator::SimulatedSensor`]
//! implements the same trait in-process.

mod serial;

pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SerialTransport};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Baud rates the sensor and host both support
pub const SUPPORTED_BAUD_RATES: [u32; 9] = [
    9600, 19200, 38400, 57600, 115_200, 128_000, 230_400, 460_800, 921_600,
];

/// Whether `baud` is one of [`SUPPORTED_BAUD_RATES`]
pub fn is_supported_baud_rate(baud: u32) -> bool {
    SUPPORTED_BAUD_RATES.contains(&baud)
}

/// Connection error types
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Baud rate outside the supported list
    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// No candidate baud rate produced a valid response
    #[error("No response from sensor on {0}")]
    NoResponse(String),

    /// Transport is not open
    #[error("Not connected")]
    NotConnected,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Writes performed
    pub writes: u64,
    /// Reads that returned data
    pub reads: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// Byte transport to a sensor
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying port
    async fn open(&mut self) -> Result<(), ConnectionError>;

    /// Close the port; closing a closed transport is a no-op
    async fn close(&mut self) -> Result<(), ConnectionError>;

    /// Check if open
    fn is_open(&self) -> bool;

    /// Send data, returning the number of bytes written
    async fn send(&mut self, data: &[u8]) -> Result<usize, ConnectionError>;

    /// Receive available data
    ///
    /// Waits at most a short read timeout and returns empty bytes when
    /// nothing arrived.
    async fn receive(&mut self) -> Result<Bytes, ConnectionError>;

    /// Change the host-side baud rate
    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError>;

    /// Port name
    fn port_name(&self) -> &str;

    /// Current host-side baud rate
    fn baud_rate(&self) -> u32;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_baud_rates() {
        assert!(is_supported_baud_rate(115_200));
        assert!(is_supported_baud_rate(128_000));
        assert!(!is_supported_baud_rate(14_400));
    }

    #[test]
    fn test_error_display() {
        let err = ConnectionError::UnsupportedBaudRate(1234);
        assert_eq!(err.to_string(), "Unsupported baud rate: 1234");
    }
}
