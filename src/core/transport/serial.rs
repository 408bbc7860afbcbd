//! Serial port transport implementation

use super::{is_supported_baud_rate, ConnectionError, Transport, TransportStats};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
}

impl SerialConfig {
    /// 8N1 configuration without flow control
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            read_timeout_ms: 100,
        }
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Set the read timeout
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("COM1", 115_200)
    }
}

type PortHandle = Arc<Mutex<Option<Box<dyn SerialPort + Send>>>>;

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: PortHandle,
    stats: Arc<RwLock<TransportStats>>,
    connected_at: Option<Instant>,
}

impl SerialTransport {
    /// Create a closed transport; fails on an unsupported baud rate
    pub fn new(config: SerialConfig) -> Result<Self, ConnectionError> {
        if !is_supported_baud_rate(config.baud_rate) {
            return Err(ConnectionError::UnsupportedBaudRate(config.baud_rate));
        }

        Ok(Self {
            config,
            port: Arc::new(Mutex::new(None)),
            stats: Arc::new(RwLock::new(TransportStats::default())),
            connected_at: None,
        })
    }

    fn map_open_error(&self, e: serialport::Error) -> ConnectionError {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound(self.config.port.clone()),
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                ConnectionError::PortNotFound(self.config.port.clone())
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                ConnectionError::PermissionDenied(self.config.port.clone())
            }
            _ => ConnectionError::ConnectionFailed(e.to_string()),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), ConnectionError> {
        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let port = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(self.config.read_timeout_ms))
            .open()
            .map_err(|e| self.map_open_error(e))?;

        *self.port.lock() = Some(port);
        self.connected_at = Some(Instant::now());
        *self.stats.write() = TransportStats::default();

        tracing::debug!(port = %self.config.port, baud = self.config.baud_rate, "serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.port.lock().take().is_some() {
            tracing::debug!(port = %self.config.port, "serial port closed");
        }
        self.connected_at = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.lock().is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        let mut port_guard = self.port.lock();
        let port = port_guard.as_mut().ok_or(ConnectionError::NotConnected)?;

        port.write_all(data)?;
        port.flush()?;

        let mut stats = self.stats.write();
        stats.bytes_sent += data.len() as u64;
        stats.writes += 1;

        Ok(data.len())
    }

    async fn receive(&mut self) -> Result<Bytes, ConnectionError> {
        let port = Arc::clone(&self.port);

        // The read blocks for up to the port timeout, keep it off the async workers.
        let bytes = tokio::task::spawn_blocking(move || -> Result<Bytes, ConnectionError> {
            let mut port_guard = port.lock();
            let port = port_guard.as_mut().ok_or(ConnectionError::NotConnected)?;
            let mut buffer = vec![0u8; 4096];

            match port.read(&mut buffer) {
                Ok(n) => {
                    buffer.truncate(n);
                    Ok(Bytes::from(buffer))
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Bytes::new()),
                Err(e) => Err(ConnectionError::Io(e)),
            }
        })
        .await
        .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))??;

        if !bytes.is_empty() {
            let mut stats = self.stats.write();
            stats.bytes_received += bytes.len() as u64;
            stats.reads += 1;
        }

        Ok(bytes)
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError> {
        if !is_supported_baud_rate(baud) {
            return Err(ConnectionError::UnsupportedBaudRate(baud));
        }

        if let Some(port) = self.port.lock().as_mut() {
            port.set_baud_rate(baud)
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
        }
        self.config.baud_rate = baud;
        tracing::debug!(port = %self.config.port, baud, "host baud rate changed");
        Ok(())
    }

    fn port_name(&self) -> &str {
        &self.config.port
    }

    fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.read().clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, ConnectionError> {
    serialport::available_ports().map_err(|e| ConnectionError::Io(e.into()))
}
