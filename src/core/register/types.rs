//! Register field sets and their closed enumerations

use super::fields::{FieldReader, FieldWriter};
use super::CodecError;
use crate::core::measurement::{Mat3f, Vec3f};
use serde::{Deserialize, Serialize};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),*
        }

        impl $name {
            /// Value carried on the wire
            pub fn value(self) -> $repr {
                match self {
                    $( Self::$variant => $value ),*
                }
            }

            /// Variant for a wire value, `None` if the value is not defined
            pub fn from_value(value: $repr) -> Option<Self> {
                $( if value == $value { return Some(Self::$variant); } )*
                None
            }
        }
    };
}

fn read_enum<T>(
    value: u32,
    field: &'static str,
    convert: impl Fn(u32) -> Option<T>,
) -> Result<T, CodecError> {
    convert(value).ok_or(CodecError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn write_vec3(w: &mut dyn FieldWriter, v: &Vec3f) {
    for &c in v {
        w.f32(c);
    }
}

fn read_vec3(r: &mut dyn FieldReader, field: &'static str) -> Result<Vec3f, CodecError> {
    Ok([r.f32(field)?, r.f32(field)?, r.f32(field)?])
}

fn check_text(field: &'static str, text: &str, max: usize) -> Result<(), CodecError> {
    let forbidden = |c: char| matches!(c, ',' | '*' | '$') || !c.is_ascii() || c.is_ascii_control();
    if text.len() > max || text.chars().any(forbidden) {
        return Err(CodecError::InvalidValue {
            field,
            value: text.to_string(),
        });
    }
    Ok(())
}

wire_enum! {
    /// Serial baud rates the sensor accepts
    pub enum BaudRate: u32 {
        /// 9600 baud
        B9600 = 9600,
        /// 19200 baud
        B19200 = 19200,
        /// 38400 baud
        B38400 = 38400,
        /// 57600 baud
        B57600 = 57600,
        /// 115200 baud
        #[default]
        B115200 = 115_200,
        /// 128000 baud
        B128000 = 128_000,
        /// 230400 baud
        B230400 = 230_400,
        /// 460800 baud
        B460800 = 460_800,
        /// 921600 baud
        B921600 = 921_600,
    }
}

wire_enum! {
    /// Serial port a setting applies to
    pub enum SerialPortSelect: u8 {
        /// Port the command arrived on
        #[default]
        Active = 0,
        /// Serial port 1
        Serial1 = 1,
        /// Serial port 2
        Serial2 = 2,
    }
}

wire_enum! {
    /// ASCII async output type
    pub enum Ador: u32 {
        /// No ASCII output
        Off = 0,
        /// Yaw, pitch, roll
        #[default]
        Ypr = 1,
        /// Quaternion
        Qtn = 2,
        /// Quaternion, magnetic, acceleration, angular rate
        Qmr = 8,
        /// Magnetic
        Mag = 10,
        /// Acceleration
        Acc = 11,
        /// Angular rate
        Gyr = 12,
        /// Magnetic, acceleration, angular rate
        Mar = 13,
        /// Yaw, pitch, roll, magnetic, acceleration, angular rate
        Ymr = 14,
        /// Yaw, pitch, roll, body linear acceleration, angular rate
        Yba = 16,
        /// Yaw, pitch, roll, inertial linear acceleration, angular rate
        Yia = 17,
        /// Uncompensated IMU
        Imu = 19,
        /// GNSS LLA
        Gps = 20,
        /// GNSS ECEF
        Gpe = 21,
        /// INS LLA
        Ins = 22,
        /// INS ECEF
        Ine = 23,
        /// Delta theta and delta velocity
        Dtv = 30,
    }
}

impl Ador {
    /// Keyword of the ASCII message this output type produces
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Ypr => Some("YPR"),
            Self::Qtn => Some("QTN"),
            Self::Qmr => Some("QMR"),
            Self::Mag => Some("MAG"),
            Self::Acc => Some("ACC"),
            Self::Gyr => Some("GYR"),
            Self::Mar => Some("MAR"),
            Self::Ymr => Some("YMR"),
            Self::Yba => Some("YBA"),
            Self::Yia => Some("YIA"),
            Self::Imu => Some("IMU"),
            Self::Gps => Some("GPS"),
            Self::Gpe => Some("GPE"),
            Self::Ins => Some("INS"),
            Self::Ine => Some("INE"),
            Self::Dtv => Some("DTV"),
        }
    }
}

wire_enum! {
    /// ASCII async output rate in Hz
    pub enum Adof: u32 {
        /// 1 Hz
        Hz1 = 1,
        /// 2 Hz
        Hz2 = 2,
        /// 4 Hz
        Hz4 = 4,
        /// 5 Hz
        Hz5 = 5,
        /// 10 Hz
        Hz10 = 10,
        /// 20 Hz
        Hz20 = 20,
        /// 25 Hz
        Hz25 = 25,
        /// 40 Hz
        #[default]
        Hz40 = 40,
        /// 50 Hz
        Hz50 = 50,
        /// 100 Hz
        Hz100 = 100,
        /// 200 Hz
        Hz200 = 200,
    }
}

wire_enum! {
    /// Heading aiding mode
    pub enum HeadingMode: u8 {
        /// Absolute heading from the magnetometer
        Absolute = 0,
        /// Relative heading, magnetometer used for drift only
        #[default]
        Relative = 1,
        /// Indoor heading
        Indoor = 2,
    }
}

wire_enum! {
    /// Attitude filter mode
    pub enum FilteringMode: u8 {
        /// No adaptive filtering
        Unfiltered = 0,
        /// Adaptive filtering
        #[default]
        AdaptivelyFiltered = 1,
    }
}

wire_enum! {
    /// Filter tuning mode
    pub enum TuningMode: u8 {
        /// Fixed tuning
        Static = 0,
        /// Adaptive tuning
        #[default]
        Adaptive = 1,
    }
}

/// Register 0: user-defined tag, up to 20 characters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserTag {
    /// Tag text
    pub tag: String,
}

impl UserTag {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        check_text("tag", &self.tag, 20)?;
        w.string(&self.tag);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self { tag: r.string("tag")? })
    }
}

/// Register 1: model number
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Model {
    /// Model string, e.g. `VN-300`
    pub model: String,
}

impl Model {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        check_text("model", &self.model, 24)?;
        w.string(&self.model);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self { model: r.string("model")? })
    }
}

/// Register 2: hardware revision
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HardwareVersion {
    /// Major revision
    pub revision: u32,
    /// Minor revision
    pub minor: u32,
}

impl HardwareVersion {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        w.u32(self.revision);
        w.u32(self.minor);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            revision: r.u32("revision")?,
            minor: r.u32("minor")?,
        })
    }
}

/// Register 3: serial number
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SerialNumber {
    /// Serial number
    pub serial_num: u32,
}

impl SerialNumber {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        w.u32(self.serial_num);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            serial_num: r.u32("serial_num")?,
        })
    }
}

/// Register 4: firmware version
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Dotted version string
    pub version: String,
}

impl FirmwareVersion {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        check_text("version", &self.version, 24)?;
        w.string(&self.version);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            version: r.string("version")?,
        })
    }
}

/// Register 5: serial baud rate
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BaudRateRegister {
    /// Baud rate
    pub baud_rate: BaudRate,
    /// Port the rate applies to
    pub serial_port: SerialPortSelect,
}

impl BaudRateRegister {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        w.u32(self.baud_rate.value());
        w.u8(self.serial_port.value());
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            baud_rate: read_enum(r.u32("baud_rate")?, "baud_rate", BaudRate::from_value)?,
            serial_port: read_serial_port(r)?,
        })
    }
}

fn read_serial_port(r: &mut dyn FieldReader) -> Result<SerialPortSelect, CodecError> {
    let value = r.u8("serial_port")?;
    read_enum(u32::from(value), "serial_port", |v| {
        u8::try_from(v).ok().and_then(SerialPortSelect::from_value)
    })
}

/// Register 6: ASCII async output type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AsyncDataOutputType {
    /// Output type
    pub ador: Ador,
    /// Port the setting applies to
    pub serial_port: SerialPortSelect,
}

impl AsyncDataOutputType {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        w.u32(self.ador.value());
        w.u8(self.serial_port.value());
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            ador: read_enum(r.u32("ador")?, "ador", Ador::from_value)?,
            serial_port: read_serial_port(r)?,
        })
    }
}

/// Register 7: ASCII async output rate
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AsyncDataOutputFrequency {
    /// Output rate
    pub adof: Adof,
    /// Port the setting applies to
    pub serial_port: SerialPortSelect,
}

impl AsyncDataOutputFrequency {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        w.u32(self.adof.value());
        w.u8(self.serial_port.value());
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            adof: read_enum(r.u32("adof")?, "adof", Adof::from_value)?,
            serial_port: read_serial_port(r)?,
        })
    }
}

/// Register 8: attitude as yaw, pitch, roll
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct YawPitchRoll {
    /// Degrees
    pub yaw: f32,
    /// Degrees
    pub pitch: f32,
    /// Degrees
    pub roll: f32,
}

impl YawPitchRoll {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        write_vec3(w, &[self.yaw, self.pitch, self.roll]);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        let [yaw, pitch, roll] = read_vec3(r, "ypr")?;
        Ok(Self { yaw, pitch, roll })
    }
}

/// Register 9: attitude quaternion, scalar last
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttitudeQuaternion {
    /// x, y, z, w
    pub quat: [f32; 4],
}

impl AttitudeQuaternion {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        for &c in &self.quat {
            w.f32(c);
        }
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            quat: [r.f32("quat")?, r.f32("quat")?, r.f32("quat")?, r.f32("quat")?],
        })
    }
}

/// Registers 17, 18 and 19: one compensated vector
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VectorMeasurement {
    /// x, y, z
    pub value: Vec3f,
}

impl VectorMeasurement {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        write_vec3(w, &self.value);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            value: read_vec3(r, "value")?,
        })
    }
}

/// Register 21: magnetic and gravity reference vectors
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MagneticGravityReference {
    /// Gauss
    pub mag_ref: Vec3f,
    /// m/s^2
    pub grav_ref: Vec3f,
}

impl MagneticGravityReference {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        write_vec3(w, &self.mag_ref);
        write_vec3(w, &self.grav_ref);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            mag_ref: read_vec3(r, "mag_ref")?,
            grav_ref: read_vec3(r, "grav_ref")?,
        })
    }
}

/// Register 26: reference frame rotation matrix, row major
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceFrameRotation {
    /// Rotation matrix
    pub rfr: Mat3f,
}

impl ReferenceFrameRotation {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        for row in &self.rfr {
            write_vec3(w, row);
        }
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            rfr: [read_vec3(r, "rfr")?, read_vec3(r, "rfr")?, read_vec3(r, "rfr")?],
        })
    }
}

/// Register 27: attitude with compensated IMU vectors
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct YprMagAccelAngularRates {
    /// Yaw, pitch, roll
    pub ypr: Vec3f,
    /// Magnetic field
    pub mag: Vec3f,
    /// Acceleration
    pub accel: Vec3f,
    /// Angular rate
    pub gyro: Vec3f,
}

impl YprMagAccelAngularRates {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        write_vec3(w, &self.ypr);
        write_vec3(w, &self.mag);
        write_vec3(w, &self.accel);
        write_vec3(w, &self.gyro);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            ypr: read_vec3(r, "ypr")?,
            mag: read_vec3(r, "mag")?,
            accel: read_vec3(r, "accel")?,
            gyro: read_vec3(r, "gyro")?,
        })
    }
}

/// Register 35: attitude filter basic control
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VpeBasicControl {
    /// Reserved, echoed back unchanged
    pub resv: u8,
    /// Heading mode
    pub heading_mode: HeadingMode,
    /// Filtering mode
    pub filtering_mode: FilteringMode,
    /// Tuning mode
    pub tuning_mode: TuningMode,
}

impl VpeBasicControl {
    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        w.u8(self.resv);
        w.u8(self.heading_mode.value());
        w.u8(self.filtering_mode.value());
        w.u8(self.tuning_mode.value());
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        let resv = r.u8("resv")?;
        let heading = r.u8("heading_mode")?;
        let filtering = r.u8("filtering_mode")?;
        let tuning = r.u8("tuning_mode")?;
        Ok(Self {
            resv,
            heading_mode: read_enum(u32::from(heading), "heading_mode", |v| {
                u8::try_from(v).ok().and_then(HeadingMode::from_value)
            })?,
            filtering_mode: read_enum(u32::from(filtering), "filtering_mode", |v| {
                u8::try_from(v).ok().and_then(FilteringMode::from_value)
            })?,
            tuning_mode: read_enum(u32::from(tuning), "tuning_mode", |v| {
                u8::try_from(v).ok().and_then(TuningMode::from_value)
            })?,
        })
    }
}

/// Register 54: uncompensated IMU measurements
///
/// Temperature travels as a fixed-point value in hundredths of a degree and
/// pressure in thousandths of a kilopascal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuMeasurements {
    /// Uncompensated magnetic field
    pub uncomp_mag: Vec3f,
    /// Uncompensated acceleration
    pub uncomp_accel: Vec3f,
    /// Uncompensated angular rate
    pub uncomp_gyro: Vec3f,
    /// Degrees Celsius
    pub temperature: f32,
    /// Kilopascal
    pub pressure: f32,
}

impl ImuMeasurements {
    const TEMPERATURE_DECIMALS: u32 = 2;
    const PRESSURE_DECIMALS: u32 = 3;

    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        write_vec3(w, &self.uncomp_mag);
        write_vec3(w, &self.uncomp_accel);
        write_vec3(w, &self.uncomp_gyro);
        w.fixed(self.temperature, Self::TEMPERATURE_DECIMALS);
        w.fixed(self.pressure, Self::PRESSURE_DECIMALS);
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        Ok(Self {
            uncomp_mag: read_vec3(r, "uncomp_mag")?,
            uncomp_accel: read_vec3(r, "uncomp_accel")?,
            uncomp_gyro: read_vec3(r, "uncomp_gyro")?,
            temperature: r.fixed("temperature", Self::TEMPERATURE_DECIMALS)?,
            pressure: r.fixed("pressure", Self::PRESSURE_DECIMALS)?,
        })
    }
}
