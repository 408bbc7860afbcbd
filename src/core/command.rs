//! Commands and their correlation with responses
//!
//! A [`CommandRequest`] knows the sentence it sends and how to recognise the
//! sentence that answers it. [`Command`] is the bookkeeping record the
//! dispatcher keeps while one request is in flight.

use crate::core::measurement::{Quaternion, Ypr};
use crate::core::protocol::{AsciiSentence, ChecksumMode};
use crate::core::register::{self, CodecError, Register};
use crate::core::transport::ConnectionError;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Response keywords that can answer a command
pub const RESPONSE_KEYWORDS: [&str; 11] = [
    "RRG", "WRG", "WNV", "RFS", "RST", "ASY", "KMD", "KAD", "SIH", "SFB", "ERR",
];

/// Whether a sentence is a command response rather than telemetry
pub fn is_response(sentence: &AsciiSentence) -> bool {
    RESPONSE_KEYWORDS.contains(&sentence.keyword())
}

/// Error codes reported by the sensor in `$VNERR` sentences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// Firmware hard fault
    HardFault,
    /// Input buffer overflow
    SerialBufferOverflow,
    /// Command checksum did not match
    InvalidChecksum,
    /// Unknown command
    InvalidCommand,
    /// Too few parameters
    NotEnoughParameters,
    /// Too many parameters
    TooManyParameters,
    /// Parameter out of range
    InvalidParameter,
    /// Unknown register
    InvalidRegister,
    /// Register cannot be accessed this way
    UnauthorizedAccess,
    /// Watchdog reset occurred
    WatchdogReset,
    /// Output buffer overflow
    OutputBufferOverflow,
    /// Baud rate too low for the configured output
    InsufficientBaudRate,
    /// Error buffer overflow
    ErrorBufferOverflow,
    /// Code not listed above
    Other(u8),
}

impl SensorError {
    /// Error for a wire code
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::HardFault,
            2 => Self::SerialBufferOverflow,
            3 => Self::InvalidChecksum,
            4 => Self::InvalidCommand,
            5 => Self::NotEnoughParameters,
            6 => Self::TooManyParameters,
            7 => Self::InvalidParameter,
            8 => Self::InvalidRegister,
            9 => Self::UnauthorizedAccess,
            10 => Self::WatchdogReset,
            11 => Self::OutputBufferOverflow,
            12 => Self::InsufficientBaudRate,
            255 => Self::ErrorBufferOverflow,
            other => Self::Other(other),
        }
    }

    /// Wire code
    pub fn code(self) -> u8 {
        match self {
            Self::HardFault => 1,
            Self::SerialBufferOverflow => 2,
            Self::InvalidChecksum => 3,
            Self::InvalidCommand => 4,
            Self::NotEnoughParameters => 5,
            Self::TooManyParameters => 6,
            Self::InvalidParameter => 7,
            Self::InvalidRegister => 8,
            Self::UnauthorizedAccess => 9,
            Self::WatchdogReset => 10,
            Self::OutputBufferOverflow => 11,
            Self::InsufficientBaudRate => 12,
            Self::ErrorBufferOverflow => 255,
            Self::Other(code) => code,
        }
    }

    /// Whether the sensor raises this error on its own rather than in answer
    /// to a command
    pub fn is_asynchronous(self) -> bool {
        matches!(
            self,
            Self::HardFault
                | Self::SerialBufferOverflow
                | Self::WatchdogReset
                | Self::OutputBufferOverflow
                | Self::ErrorBufferOverflow
        )
    }

    /// Parse the code of a `$VNERR,<hex>` sentence
    pub fn from_sentence(sentence: &AsciiSentence) -> Option<Self> {
        if sentence.keyword() != "ERR" {
            return None;
        }
        let code = u8::from_str_radix(sentence.field(0)?.trim(), 16).ok()?;
        Some(Self::from_code(code))
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "sensor error {code:#04X}"),
            known => write!(f, "{known:?} ({:#04X})", known.code()),
        }
    }
}

/// Command error types
#[derive(Error, Debug)]
pub enum CommandError {
    /// No response after every attempt
    #[error("No response after {attempts} attempts")]
    Timeout {
        /// Sends performed
        attempts: u32,
    },

    /// Response could not be interpreted
    #[error("Command failed: {0}")]
    Failed(String),

    /// A firmware update owns the connection
    #[error("Sensor is busy with a firmware update")]
    Busy,

    /// Sensor answered with an error
    #[error("Sensor error: {0}")]
    Sensor(SensorError),

    /// Transport failure while sending
    #[error("Transport error: {0}")]
    Transport(#[from] ConnectionError),

    /// No connection
    #[error("Sensor is disconnected")]
    Disconnected,

    /// Register encode or decode failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Command direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Register read
    Read,
    /// Register write
    Write,
    /// Action without register payload
    Action,
}

/// What a command asks of the sensor
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRequest {
    /// Read register `id`
    ReadRegister {
        /// Register id
        id: u8,
    },
    /// Write a register value
    WriteRegister(Register),
    /// Save the current configuration to non-volatile memory
    WriteSettings,
    /// Restore factory defaults
    RestoreFactorySettings,
    /// Reset the sensor
    Reset,
    /// Pause or resume asynchronous output
    AsyncOutputEnable(bool),
    /// Tell the filter a magnetic disturbance is present or gone
    KnownMagneticDisturbance(bool),
    /// Tell the filter an acceleration disturbance is present or gone
    KnownAccelerationDisturbance(bool),
    /// Seed the heading estimate, degrees
    SetInitialHeading(f32),
    /// Seed the heading estimate from a full attitude
    SetInitialHeadingYpr(Ypr),
    /// Seed the heading estimate from a quaternion
    SetInitialHeadingQuaternion(Quaternion),
    /// Capture the current filter bias estimates
    SetFilterBias,
}

impl CommandRequest {
    /// Keyword sent and echoed back
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::ReadRegister { .. } => "RRG",
            Self::WriteRegister(_) => "WRG",
            Self::WriteSettings => "WNV",
            Self::RestoreFactorySettings => "RFS",
            Self::Reset => "RST",
            Self::AsyncOutputEnable(_) => "ASY",
            Self::KnownMagneticDisturbance(_) => "KMD",
            Self::KnownAccelerationDisturbance(_) => "KAD",
            Self::SetInitialHeading(_)
            | Self::SetInitialHeadingYpr(_)
            | Self::SetInitialHeadingQuaternion(_) => "SIH",
            Self::SetFilterBias => "SFB",
        }
    }

    /// Command direction
    pub fn direction(&self) -> Direction {
        match self {
            Self::ReadRegister { .. } => Direction::Read,
            Self::WriteRegister(_) => Direction::Write,
            _ => Direction::Action,
        }
    }

    /// Register id for register commands
    pub fn register_id(&self) -> Option<u8> {
        match self {
            Self::ReadRegister { id } => Some(*id),
            Self::WriteRegister(register) => Some(register.id()),
            _ => None,
        }
    }

    /// Outgoing sentence
    pub fn sentence(&self) -> Result<AsciiSentence, CodecError> {
        let flag = |on: bool| if on { "1" } else { "0" };
        let sentence = match self {
            Self::ReadRegister { id } => register::encode_read(*id),
            Self::WriteRegister(register) => register::write_sentence(register)?,
            Self::AsyncOutputEnable(on)
            | Self::KnownMagneticDisturbance(on)
            | Self::KnownAccelerationDisturbance(on) => AsciiSentence::new(self.keyword(), [flag(*on)]),
            Self::SetInitialHeading(heading) => {
                AsciiSentence::new(self.keyword(), [format!("{heading:+08.3}")])
            }
            Self::SetInitialHeadingYpr(ypr) => AsciiSentence::new(
                self.keyword(),
                [ypr.yaw, ypr.pitch, ypr.roll].map(|v| format!("{v:+08.3}")),
            ),
            Self::SetInitialHeadingQuaternion(q) => AsciiSentence::new(
                self.keyword(),
                [q.x, q.y, q.z, q.w].map(|v| format!("{v:+.6}")),
            ),
            _ => AsciiSentence::new(self.keyword(), Vec::<String>::new()),
        };
        Ok(sentence)
    }

    /// Whether `response` answers this request
    ///
    /// Register commands additionally require the echoed register id to match.
    pub fn matches(&self, response: &AsciiSentence) -> bool {
        if response.keyword() != self.keyword() {
            return false;
        }
        match self.register_id() {
            Some(id) => register::response_register_id(response) == Some(id),
            None => true,
        }
    }
}

/// Terminal state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Waiting for a response
    Pending,
    /// A matching response arrived
    Fulfilled,
    /// Every attempt timed out
    TimedOut,
    /// Sensor error or unusable response
    Failed,
}

/// One command in flight
#[derive(Debug, Clone)]
pub struct Command {
    /// Correlation token
    pub token: Uuid,
    /// Request
    pub request: CommandRequest,
    /// Time of the first send
    pub issued_at: Instant,
    /// Resends after the first attempt
    pub retries: u32,
    /// Current state
    pub state: CommandState,
}

impl Command {
    /// New pending command
    pub fn new(request: CommandRequest) -> Self {
        Self {
            token: Uuid::new_v4(),
            request,
            issued_at: Instant::now(),
            retries: 0,
            state: CommandState::Pending,
        }
    }

    /// Framed bytes to put on the wire
    pub fn encode(&self, mode: ChecksumMode) -> Result<Vec<u8>, CodecError> {
        Ok(self.request.sentence()?.to_bytes(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register::{BaudRate, BaudRateRegister, SerialPortSelect};

    #[test]
    fn test_register_matching_uses_id() {
        let request = CommandRequest::ReadRegister { id: 5 };
        assert!(request.matches(&AsciiSentence::new("RRG", ["05", "115200", "0"])));
        assert!(!request.matches(&AsciiSentence::new("RRG", ["6", "1", "0"])));
        assert!(!request.matches(&AsciiSentence::new("WRG", ["5", "115200", "0"])));
    }

    #[test]
    fn test_action_matching_uses_keyword() {
        assert!(CommandRequest::WriteSettings.matches(&AsciiSentence::new("WNV", Vec::<String>::new())));
        assert!(!CommandRequest::Reset.matches(&AsciiSentence::new("WNV", Vec::<String>::new())));
    }

    #[test]
    fn test_sentences() {
        assert_eq!(CommandRequest::AsyncOutputEnable(false).sentence().unwrap().body(), "VNASY,0");
        assert_eq!(
            CommandRequest::SetInitialHeading(12.5).sentence().unwrap().body(),
            "VNSIH,+012.500"
        );
        let write = CommandRequest::WriteRegister(Register::BaudRate(BaudRateRegister {
            baud_rate: BaudRate::B230400,
            serial_port: SerialPortSelect::Active,
        }));
        assert_eq!(write.sentence().unwrap().body(), "VNWRG,5,230400,0");
        assert_eq!(write.direction(), Direction::Write);

        let ypr = Ypr {
            yaw: 90.0,
            pitch: -1.5,
            roll: 0.25,
        };
        assert_eq!(
            CommandRequest::SetInitialHeadingYpr(ypr).sentence().unwrap().body(),
            "VNSIH,+090.000,-001.500,+000.250"
        );
        let q = Quaternion {
            x: 0.0,
            y: 0.0,
            z: 0.5,
            w: -0.5,
        };
        assert_eq!(
            CommandRequest::SetInitialHeadingQuaternion(q).sentence().unwrap().body(),
            "VNSIH,+0.000000,+0.000000,+0.500000,-0.500000"
        );
        assert_eq!(CommandRequest::SetFilterBias.sentence().unwrap().body(), "VNSFB");
        assert!(CommandRequest::SetFilterBias.matches(&AsciiSentence::new("SFB", Vec::<String>::new())));
    }

    #[test]
    fn test_error_classes() {
        for code in [1, 2, 0x0A, 0x0B, 0xFF] {
            assert!(SensorError::from_code(code).is_asynchronous(), "{code}");
        }
        for code in [3, 4, 5, 6, 7, 8, 9, 0x0C] {
            assert!(!SensorError::from_code(code).is_asynchronous(), "{code}");
        }
    }

    #[test]
    fn test_sensor_error_codes() {
        let sentence = AsciiSentence::new("ERR", ["0C"]);
        assert_eq!(
            SensorError::from_sentence(&sentence),
            Some(SensorError::InsufficientBaudRate)
        );
        assert_eq!(SensorError::from_code(0x42), SensorError::Other(0x42));
        assert_eq!(SensorError::ErrorBufferOverflow.code(), 255);
        assert!(is_response(&sentence));
        assert!(!is_response(&AsciiSentence::new("YPR", ["1", "2", "3"])));
    }
}
