//! Telemetry measurements
//!
//! A [`Measurement`] is the decoded form of one asynchronous packet. Every
//! group and every field inside a group is optional: which ones are present
//! depends on the ASCII message type or on the binary output configuration
//! that produced the packet.

mod ascii;
mod binary;

pub use ascii::{ascii_layout, decode_ascii, encode_ascii, AsciiField, ASCII_MESSAGES};
pub use binary::{decode_binary, encode_binary_payload};

use crate::core::protocol::BinaryHeader;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Three single-precision components
pub type Vec3f = [f32; 3];

/// Three double-precision components
pub type Vec3d = [f64; 3];

/// Row-major 3x3 matrix
pub type Mat3f = [[f32; 3]; 3];

/// Yaw, pitch and roll in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Ypr {
    /// Yaw
    pub yaw: f32,
    /// Pitch
    pub pitch: f32,
    /// Roll
    pub roll: f32,
}

/// Attitude quaternion, scalar last
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Quaternion {
    /// x
    pub x: f32,
    /// y
    pub y: f32,
    /// z
    pub z: f32,
    /// Scalar part
    pub w: f32,
}

/// UTC time as reported by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[allow(missing_docs)]
pub struct TimeUtc {
    /// Years since 2000
    pub year: i8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Milliseconds
    pub ms: u16,
}

/// Integrated rotation over an output interval
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DeltaTheta {
    /// Integration time in seconds
    pub delta_time: f32,
    /// Integrated rotation in degrees
    pub delta_theta: Vec3f,
}

/// GNSS time validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GnssTimeInfo {
    /// Status flags
    pub status: u8,
    /// GPS leap seconds
    pub leap_seconds: i8,
}

/// Dilution of precision
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[allow(missing_docs)]
pub struct Dop {
    pub geometric: f32,
    pub position: f32,
    pub time: f32,
    pub vertical: f32,
    pub horizontal: f32,
    pub north: f32,
    pub east: f32,
}

/// Time and synchronisation fields
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[allow(missing_docs)]
pub struct TimeGroup {
    /// Nanoseconds since startup
    pub time_startup: Option<u64>,
    /// Nanoseconds since GPS epoch
    pub time_gps: Option<u64>,
    /// GPS time of week in nanoseconds
    pub gps_tow: Option<u64>,
    pub gps_week: Option<u16>,
    /// Nanoseconds since the last SyncIn trigger
    pub time_sync_in: Option<u64>,
    pub time_gps_pps: Option<u64>,
    pub time_utc: Option<TimeUtc>,
    pub sync_in_cnt: Option<u32>,
    pub sync_out_cnt: Option<u32>,
    pub time_status: Option<u8>,
}

/// Inertial sensor fields
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[allow(missing_docs)]
pub struct ImuGroup {
    pub imu_status: Option<u16>,
    pub uncomp_mag: Option<Vec3f>,
    pub uncomp_accel: Option<Vec3f>,
    pub uncomp_gyro: Option<Vec3f>,
    /// Degrees Celsius
    pub temperature: Option<f32>,
    /// Kilopascal
    pub pressure: Option<f32>,
    pub delta_theta: Option<DeltaTheta>,
    pub delta_vel: Option<Vec3f>,
    pub mag: Option<Vec3f>,
    pub accel: Option<Vec3f>,
    pub angular_rate: Option<Vec3f>,
    pub sens_sat: Option<u16>,
}

/// GNSS receiver fields
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[allow(missing_docs)]
pub struct GnssGroup {
    pub time_utc: Option<TimeUtc>,
    pub tow: Option<u64>,
    pub week: Option<u16>,
    pub num_sats: Option<u8>,
    pub fix: Option<u8>,
    pub pos_lla: Option<Vec3d>,
    pub pos_ecef: Option<Vec3d>,
    pub vel_ned: Option<Vec3f>,
    pub vel_ecef: Option<Vec3f>,
    pub pos_u: Option<Vec3f>,
    pub vel_u: Option<f32>,
    pub time_u: Option<f32>,
    pub time_info: Option<GnssTimeInfo>,
    pub dop: Option<Dop>,
}

/// Attitude fields
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[allow(missing_docs)]
pub struct AttitudeGroup {
    pub ypr: Option<Ypr>,
    pub quaternion: Option<Quaternion>,
    pub dcm: Option<Mat3f>,
    pub mag_ned: Option<Vec3f>,
    pub accel_ned: Option<Vec3f>,
    pub lin_accel_body: Option<Vec3f>,
    pub lin_accel_ned: Option<Vec3f>,
    pub ypr_u: Option<Vec3f>,
}

/// Navigation solution fields
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[allow(missing_docs)]
pub struct InsGroup {
    pub ins_status: Option<u16>,
    pub pos_lla: Option<Vec3d>,
    pub pos_ecef: Option<Vec3d>,
    pub vel_body: Option<Vec3f>,
    pub vel_ned: Option<Vec3f>,
    pub vel_ecef: Option<Vec3f>,
    pub mag_ecef: Option<Vec3f>,
    pub accel_ecef: Option<Vec3f>,
    pub lin_accel_ecef: Option<Vec3f>,
    /// Attitude uncertainty in degrees, reported by ASCII INS messages
    pub att_u: Option<f32>,
    pub pos_u: Option<f32>,
    pub vel_u: Option<f32>,
}

/// Where a measurement came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MeasurementSource {
    /// ASCII async sentence
    Ascii {
        /// Sentence header, e.g. `VNYPR`
        header: String,
    },
    /// Binary packet
    Binary {
        /// Packet header
        header: BinaryHeader,
        /// Id of the binary output register whose layout matched
        output: u8,
    },
}

/// One decoded telemetry packet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Packet origin
    pub source: MeasurementSource,
    /// Host time the packet was decoded
    pub received_at: DateTime<Utc>,
    /// Time group
    pub time: Option<TimeGroup>,
    /// IMU group
    pub imu: Option<ImuGroup>,
    /// GNSS group
    pub gnss: Option<GnssGroup>,
    /// Attitude group
    pub attitude: Option<AttitudeGroup>,
    /// INS group
    pub ins: Option<InsGroup>,
}

impl Measurement {
    /// Empty measurement for a source
    pub fn new(source: MeasurementSource) -> Self {
        Self {
            source,
            received_at: Utc::now(),
            time: None,
            imu: None,
            gnss: None,
            attitude: None,
            ins: None,
        }
    }

    /// Whether this measurement came from the ASCII message with `header`
    ///
    /// Accepts the header with or without the `VN` prefix.
    pub fn matches_message(&self, header: &str) -> bool {
        match &self.source {
            MeasurementSource::Ascii { header: own } => {
                own == header || own.strip_prefix("VN") == Some(header)
            }
            MeasurementSource::Binary { .. } => false,
        }
    }

    /// Whether this measurement came from a binary packet
    pub fn is_binary(&self) -> bool {
        matches!(self.source, MeasurementSource::Binary { .. })
    }

    /// Whether no group is populated
    pub fn is_empty(&self) -> bool {
        self.time.is_none()
            && self.imu.is_none()
            && self.gnss.is_none()
            && self.attitude.is_none()
            && self.ins.is_none()
    }

    pub(crate) fn time_mut(&mut self) -> &mut TimeGroup {
        self.time.get_or_insert_with(TimeGroup::default)
    }

    pub(crate) fn imu_mut(&mut self) -> &mut ImuGroup {
        self.imu.get_or_insert_with(ImuGroup::default)
    }

    pub(crate) fn gnss_mut(&mut self) -> &mut GnssGroup {
        self.gnss.get_or_insert_with(GnssGroup::default)
    }

    pub(crate) fn attitude_mut(&mut self) -> &mut AttitudeGroup {
        self.attitude.get_or_insert_with(AttitudeGroup::default)
    }

    pub(crate) fn ins_mut(&mut self) -> &mut InsGroup {
        self.ins.get_or_insert_with(InsGroup::default)
    }
}
