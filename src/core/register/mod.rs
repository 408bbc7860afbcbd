//! Register codec
//!
//! Every register the crate knows is one variant of the closed [`Register`]
//! enum, selected by id at the codec boundary. Fields are encoded in the
//! order the protocol defines for that id, either as comma-separated ASCII
//! tokens (the command format) or as packed little-endian binary.

mod binary_output;
pub mod fields;
mod types;

pub use binary_output::{AsyncMode, BinaryOutputGroup};
pub use types::{
    Adof, Ador, AsyncDataOutputFrequency, AsyncDataOutputType, AttitudeQuaternion, BaudRate,
    BaudRateRegister, FilteringMode, FirmwareVersion, HardwareVersion, HeadingMode,
    ImuMeasurements, MagneticGravityReference, Model, ReferenceFrameRotation, SerialNumber,
    SerialPortSelect, TuningMode, UserTag, VectorMeasurement, VpeBasicControl, YawPitchRoll,
    YprMagAccelAngularRates,
};

use crate::core::protocol::AsciiSentence;
use fields::{AsciiReader, AsciiWriter, FieldReader, FieldWriter, PackedReader, PackedWriter};
use thiserror::Error;

/// Register codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Value outside the closed set of valid values
    #[error("invalid value for {field}: {value}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Offending value
        value: String,
    },

    /// Wrong number of fields
    #[error("expected {expected} fields, found {found}")]
    FieldCount {
        /// Fields expected
        expected: usize,
        /// Fields present
        found: usize,
    },

    /// Token could not be parsed as the field's type
    #[error("cannot parse {field} from {value:?}")]
    Parse {
        /// Field name
        field: &'static str,
        /// Offending token
        value: String,
    },

    /// Response names a different register
    #[error("response for register {found}, expected {expected}")]
    RegisterMismatch {
        /// Register requested
        expected: u8,
        /// Register named by the response
        found: String,
    },

    /// Id is not one of the known registers
    #[error("unknown register {0}")]
    UnknownRegister(u8),

    /// Register cannot be written
    #[error("register {0} is read-only")]
    ReadOnly(u8),

    /// Packed body too short
    #[error("truncated register body")]
    Truncated,

    /// Sentence is not a register response
    #[error("unexpected response {0}")]
    UnexpectedResponse(String),
}

/// Field encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Comma-separated ASCII tokens
    #[default]
    Ascii,
    /// Packed little-endian fields
    Binary,
}

macro_rules! registers {
    ($( $(#[$meta:meta])* $variant:ident($ty:ty) = $id:literal, $writable:literal; )*) => {
        /// A register value, one variant per register id
        #[derive(Debug, Clone, PartialEq)]
        pub enum Register {
            $( $(#[$meta])* $variant($ty), )*
        }

        impl Register {
            /// Register id
            pub fn id(&self) -> u8 {
                match self {
                    $( Self::$variant(_) => $id, )*
                }
            }

            /// Register name
            pub fn name(&self) -> &'static str {
                match self {
                    $( Self::$variant(_) => stringify!($variant), )*
                }
            }

            /// Whether the device accepts writes to this register
            pub fn is_writable(&self) -> bool {
                match self {
                    $( Self::$variant(_) => $writable, )*
                }
            }

            /// Register with default field values for `id`
            pub fn from_id(id: u8) -> Option<Self> {
                match id {
                    $( $id => Some(Self::$variant(<$ty>::default())), )*
                    _ => None,
                }
            }

            /// Ids of every known register
            pub fn known_ids() -> &'static [u8] {
                &[$( $id, )*]
            }

            fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
                match self {
                    $( Self::$variant(value) => value.write_fields(w), )*
                }
            }

            fn read_fields(id: u8, r: &mut dyn FieldReader) -> Result<Self, CodecError> {
                match id {
                    $( $id => <$ty>::read_fields(r).map(Self::$variant), )*
                    _ => Err(CodecError::UnknownRegister(id)),
                }
            }
        }
    };
}

registers! {
    /// 0: user tag
    UserTag(UserTag) = 0, true;
    /// 1: model number
    Model(Model) = 1, false;
    /// 2: hardware revision
    HardwareVersion(HardwareVersion) = 2, false;
    /// 3: serial number
    SerialNumber(SerialNumber) = 3, false;
    /// 4: firmware version
    FirmwareVersion(FirmwareVersion) = 4, false;
    /// 5: serial baud rate
    BaudRate(BaudRateRegister) = 5, true;
    /// 6: ASCII async output type
    AsyncDataOutputType(AsyncDataOutputType) = 6, true;
    /// 7: ASCII async output rate
    AsyncDataOutputFrequency(AsyncDataOutputFrequency) = 7, true;
    /// 8: yaw, pitch, roll
    YawPitchRoll(YawPitchRoll) = 8, false;
    /// 9: attitude quaternion
    Quaternion(AttitudeQuaternion) = 9, false;
    /// 17: compensated magnetic field
    MagneticMeasurements(VectorMeasurement) = 17, false;
    /// 18: compensated acceleration
    AccelerationMeasurements(VectorMeasurement) = 18, false;
    /// 19: compensated angular rate
    AngularRateMeasurements(VectorMeasurement) = 19, false;
    /// 21: magnetic and gravity reference vectors
    MagneticGravityReference(MagneticGravityReference) = 21, true;
    /// 26: reference frame rotation
    ReferenceFrameRotation(ReferenceFrameRotation) = 26, true;
    /// 27: yaw, pitch, roll, magnetic, acceleration and angular rates
    YprMagAccelAngularRates(YprMagAccelAngularRates) = 27, false;
    /// 35: attitude filter basic control
    VpeBasicControl(VpeBasicControl) = 35, true;
    /// 54: uncompensated IMU measurements
    ImuMeasurements(ImuMeasurements) = 54, false;
    /// 75: binary output 1
    BinaryOutput1(BinaryOutputGroup) = 75, true;
    /// 76: binary output 2
    BinaryOutput2(BinaryOutputGroup) = 76, true;
    /// 77: binary output 3
    BinaryOutput3(BinaryOutputGroup) = 77, true;
}

impl Register {
    /// Binary output configuration carried by registers 75 to 77
    pub fn binary_output(&self) -> Option<&BinaryOutputGroup> {
        match self {
            Self::BinaryOutput1(g) | Self::BinaryOutput2(g) | Self::BinaryOutput3(g) => Some(g),
            _ => None,
        }
    }

    /// Field values as ASCII tokens
    pub fn ascii_fields(&self) -> Result<Vec<String>, CodecError> {
        let mut w = AsciiWriter::new();
        self.write_fields(&mut w)?;
        Ok(w.into_tokens())
    }

    /// Field values packed as `[id][fields]`
    pub fn pack(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = PackedWriter::new();
        w.u8(self.id());
        self.write_fields(&mut w)?;
        Ok(w.into_bytes())
    }
}

/// Read command for `id`: `VNRRG,<id>`
pub fn encode_read(id: u8) -> AsciiSentence {
    AsciiSentence::new("RRG", [id.to_string()])
}

/// Write command body for `register` in the requested encoding
///
/// ASCII yields the sentence body (`VNWRG,5,115200,0`) without framing;
/// binary yields the packed register.
pub fn encode_write(register: &Register, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
    if !register.is_writable() {
        return Err(CodecError::ReadOnly(register.id()));
    }
    match encoding {
        Encoding::Ascii => Ok(write_sentence(register)?.body().into_bytes()),
        Encoding::Binary => register.pack(),
    }
}

/// Write command for `register`: `VNWRG,<id>,<fields>`
pub fn write_sentence(register: &Register) -> Result<AsciiSentence, CodecError> {
    if !register.is_writable() {
        return Err(CodecError::ReadOnly(register.id()));
    }
    let mut fields = vec![register.id().to_string()];
    fields.extend(register.ascii_fields()?);
    Ok(AsciiSentence::new("WRG", fields))
}

/// Read response for `register` as the device sends it: `VNRRG,<id>,<fields>`
pub fn response_sentence(register: &Register) -> Result<AsciiSentence, CodecError> {
    let mut fields = vec![register.id().to_string()];
    fields.extend(register.ascii_fields()?);
    Ok(AsciiSentence::new("RRG", fields))
}

/// Register id named by a response sentence
pub fn response_register_id(sentence: &AsciiSentence) -> Option<u8> {
    sentence.field(0)?.trim().parse().ok()
}

/// Decode an `RRG` or `WRG` response for `expected_id`
pub fn decode_response(expected_id: u8, sentence: &AsciiSentence) -> Result<Register, CodecError> {
    if !matches!(sentence.keyword(), "RRG" | "WRG") {
        return Err(CodecError::UnexpectedResponse(sentence.header.clone()));
    }

    let id_field = sentence.field(0).unwrap_or_default();
    if response_register_id(sentence) != Some(expected_id) {
        return Err(CodecError::RegisterMismatch {
            expected: expected_id,
            found: id_field.to_string(),
        });
    }

    let tokens = &sentence.fields[1..];
    let mut reader = AsciiReader::new(tokens);
    let register = Register::read_fields(expected_id, &mut reader)?;
    if !reader.is_exhausted() {
        let consumed = register.ascii_fields()?.len();
        return Err(CodecError::FieldCount {
            expected: consumed,
            found: tokens.len(),
        });
    }
    Ok(register)
}

/// Decode a packed register produced by [`Register::pack`]
pub fn decode_packed(expected_id: u8, bytes: &[u8]) -> Result<Register, CodecError> {
    let mut reader = PackedReader::new(bytes);
    let id = reader.u8("id")?;
    if id != expected_id {
        return Err(CodecError::RegisterMismatch {
            expected: expected_id,
            found: id.to_string(),
        });
    }
    let register = Register::read_fields(id, &mut reader)?;
    if !reader.is_exhausted() {
        return Err(CodecError::Truncated);
    }
    Ok(register)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::OutputGroup;

    fn samples() -> Vec<Register> {
        vec![
            Register::UserTag(UserTag {
                tag: "rover-2".to_string(),
            }),
            Register::Model(Model {
                model: "VN-300T-CR".to_string(),
            }),
            Register::HardwareVersion(HardwareVersion {
                revision: 3,
                minor: 1,
            }),
            Register::SerialNumber(SerialNumber {
                serial_num: 100_023_412,
            }),
            Register::FirmwareVersion(FirmwareVersion {
                version: "3.1.0.0".to_string(),
            }),
            Register::BaudRate(BaudRateRegister {
                baud_rate: BaudRate::B921600,
                serial_port: SerialPortSelect::Serial2,
            }),
            Register::AsyncDataOutputType(AsyncDataOutputType {
                ador: Ador::Ymr,
                serial_port: SerialPortSelect::Active,
            }),
            Register::AsyncDataOutputFrequency(AsyncDataOutputFrequency {
                adof: Adof::Hz200,
                serial_port: SerialPortSelect::Serial1,
            }),
            Register::YawPitchRoll(YawPitchRoll {
                yaw: 123.456,
                pitch: -0.1,
                roll: 1.0e-7,
            }),
            Register::Quaternion(AttitudeQuaternion {
                quat: [0.1, -0.2, 0.3, 0.927_361_8],
            }),
            Register::AngularRateMeasurements(VectorMeasurement {
                value: [f32::MIN_POSITIVE, -3.5, 1.0 / 3.0],
            }),
            Register::MagneticGravityReference(MagneticGravityReference {
                mag_ref: [1.0, 0.0, 1.8],
                grav_ref: [0.0, 0.0, -9.793_746],
            }),
            Register::ReferenceFrameRotation(ReferenceFrameRotation {
                rfr: [[0.0, 1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            }),
            Register::YprMagAccelAngularRates(YprMagAccelAngularRates {
                ypr: [1.5, 2.5, 3.5],
                mag: [0.2, 0.1, 0.4],
                accel: [0.0, 0.0, -9.81],
                gyro: [0.001, -0.002, 0.003],
            }),
            Register::VpeBasicControl(VpeBasicControl {
                resv: 1,
                heading_mode: HeadingMode::Indoor,
                filtering_mode: FilteringMode::Unfiltered,
                tuning_mode: TuningMode::Static,
            }),
            Register::ImuMeasurements(ImuMeasurements {
                uncomp_mag: [0.5, 0.25, 0.125],
                uncomp_accel: [0.0, 0.1, -9.8],
                uncomp_gyro: [0.0, 0.0, 0.0],
                temperature: 25.5,
                pressure: 101.25,
            }),
            Register::BinaryOutput1(
                BinaryOutputGroup::new(AsyncMode::SERIAL_1 | AsyncMode::SERIAL_2, 4)
                    .with_fields(OutputGroup::Common, 0x0029)
                    .with_fields(OutputGroup::Ins, 0x0003),
            ),
            Register::BinaryOutput3(BinaryOutputGroup::new(AsyncMode::NONE, 0)),
        ]
    }

    #[test]
    fn test_ascii_round_trip() {
        for register in samples() {
            let sentence = response_sentence(&register).unwrap();
            let decoded = decode_response(register.id(), &sentence).unwrap();
            assert_eq!(decoded, register, "{}", register.name());
        }
    }

    #[test]
    fn test_packed_round_trip() {
        for register in samples() {
            let bytes = register.pack().unwrap();
            let decoded = decode_packed(register.id(), &bytes).unwrap();
            assert_eq!(decoded, register, "{}", register.name());
        }
    }

    #[test]
    fn test_every_known_id_round_trips_defaults() {
        for &id in Register::known_ids() {
            let register = Register::from_id(id).unwrap();
            assert_eq!(register.id(), id);
            let sentence = response_sentence(&register).unwrap();
            assert_eq!(decode_response(id, &sentence).unwrap(), register);
        }
        assert!(Register::from_id(200).is_none());
    }

    #[test]
    fn test_write_command_format() {
        let register = Register::BaudRate(BaudRateRegister {
            baud_rate: BaudRate::B9600,
            serial_port: SerialPortSelect::Serial1,
        });
        let body = encode_write(&register, Encoding::Ascii).unwrap();
        assert_eq!(body, b"VNWRG,5,9600,1");
        assert_eq!(encode_read(5).body(), "VNRRG,5");

        let output = Register::BinaryOutput1(
            BinaryOutputGroup::new(AsyncMode::SERIAL_1, 40).with_fields(OutputGroup::Common, 0x0029),
        );
        assert_eq!(write_sentence(&output).unwrap().body(), "VNWRG,75,1,40,1,29");
    }

    #[test]
    fn test_read_only_register_refuses_write() {
        let register = Register::Model(Model::default());
        assert_eq!(
            encode_write(&register, Encoding::Binary),
            Err(CodecError::ReadOnly(1))
        );
        assert!(write_sentence(&register).is_err());
    }

    #[test]
    fn test_unknown_enum_value_fails() {
        let sentence = AsciiSentence::new("RRG", ["6", "99", "0"]);
        assert!(matches!(
            decode_response(6, &sentence),
            Err(CodecError::InvalidValue { field: "ador", .. })
        ));
    }

    #[test]
    fn test_register_mismatch_and_field_count() {
        let sentence = AsciiSentence::new("RRG", ["08", "1", "2", "3"]);
        assert!(decode_response(8, &sentence).is_ok());
        assert!(matches!(
            decode_response(9, &sentence),
            Err(CodecError::RegisterMismatch { expected: 9, .. })
        ));

        let extra = AsciiSentence::new("RRG", ["8", "1", "2", "3", "4"]);
        assert!(matches!(
            decode_response(8, &extra),
            Err(CodecError::FieldCount { expected: 3, found: 4 })
        ));

        let short = AsciiSentence::new("RRG", ["8", "1", "2"]);
        assert!(matches!(decode_response(8, &short), Err(CodecError::FieldCount { .. })));
    }

    #[test]
    fn test_non_register_sentence_is_rejected() {
        let sentence = AsciiSentence::new("YPR", ["1", "2", "3"]);
        assert!(matches!(
            decode_response(8, &sentence),
            Err(CodecError::UnexpectedResponse(_))
        ));
    }
}
