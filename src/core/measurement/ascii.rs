//! ASCII async messages
//!
//! Each message type is a fixed list of fields; the keyword alone says which
//! fields are present.

use super::{DeltaTheta, Measurement, MeasurementSource, Quaternion, Vec3d, Vec3f, Ypr};
use crate::core::protocol::AsciiSentence;
use crate::core::register::CodecError;
use std::str::FromStr;

const NANOS_PER_SECOND: f64 = 1e9;

/// A value carried by an ASCII async message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiField {
    /// Yaw, pitch, roll
    Ypr,
    /// Quaternion, scalar last
    Quaternion,
    /// Compensated magnetic field
    Mag,
    /// Compensated acceleration
    Accel,
    /// Compensated angular rate
    AngularRate,
    /// Linear acceleration, body frame
    LinAccelBody,
    /// Linear acceleration, inertial frame
    LinAccelNed,
    /// Uncompensated magnetic field
    UncompMag,
    /// Uncompensated acceleration
    UncompAccel,
    /// Uncompensated angular rate
    UncompGyro,
    /// Temperature
    Temperature,
    /// Pressure
    Pressure,
    /// GNSS time of week (seconds) and week
    GnssTime,
    /// GNSS fix type
    GnssFix,
    /// Satellites used in the solution
    NumSats,
    /// GNSS latitude, longitude, altitude
    GnssPosLla,
    /// GNSS ECEF position
    GnssPosEcef,
    /// GNSS velocity, NED frame
    GnssVelNed,
    /// GNSS velocity, ECEF frame
    GnssVelEcef,
    /// GNSS position accuracy per axis
    GnssPosAcc,
    /// GNSS speed accuracy
    GnssSpeedAcc,
    /// GNSS time accuracy
    GnssTimeAcc,
    /// INS solution time of week (seconds) and week
    InsTime,
    /// INS status word, hexadecimal on the wire
    InsStatus,
    /// INS latitude, longitude, altitude
    InsPosLla,
    /// INS ECEF position
    InsPosEcef,
    /// INS velocity, NED frame
    InsVelNed,
    /// INS velocity, ECEF frame
    InsVelEcef,
    /// INS attitude uncertainty
    AttUncertainty,
    /// INS position uncertainty
    PosUncertainty,
    /// INS velocity uncertainty
    VelUncertainty,
    /// Integration time and delta theta
    DeltaTheta,
    /// Delta velocity
    DeltaVel,
}

impl AsciiField {
    /// Number of comma-separated tokens this value spans
    pub fn width(self) -> usize {
        match self {
            Self::Quaternion | Self::DeltaTheta => 4,
            Self::GnssTime | Self::InsTime => 2,
            Self::Temperature
            | Self::Pressure
            | Self::GnssFix
            | Self::NumSats
            | Self::GnssSpeedAcc
            | Self::GnssTimeAcc
            | Self::InsStatus
            | Self::AttUncertainty
            | Self::PosUncertainty
            | Self::VelUncertainty => 1,
            _ => 3,
        }
    }
}

use AsciiField as F;

/// Known async message keywords and their field layouts
pub const ASCII_MESSAGES: &[(&str, &[AsciiField])] = &[
    ("YPR", &[F::Ypr]),
    ("QTN", &[F::Quaternion]),
    ("QMR", &[F::Quaternion, F::Mag, F::Accel, F::AngularRate]),
    ("MAG", &[F::Mag]),
    ("ACC", &[F::Accel]),
    ("GYR", &[F::AngularRate]),
    ("MAR", &[F::Mag, F::Accel, F::AngularRate]),
    ("YMR", &[F::Ypr, F::Mag, F::Accel, F::AngularRate]),
    ("YBA", &[F::Ypr, F::LinAccelBody, F::AngularRate]),
    ("YIA", &[F::Ypr, F::LinAccelNed, F::AngularRate]),
    (
        "IMU",
        &[F::UncompMag, F::UncompAccel, F::UncompGyro, F::Temperature, F::Pressure],
    ),
    (
        "GPS",
        &[
            F::GnssTime,
            F::GnssFix,
            F::NumSats,
            F::GnssPosLla,
            F::GnssVelNed,
            F::GnssPosAcc,
            F::GnssSpeedAcc,
            F::GnssTimeAcc,
        ],
    ),
    (
        "GPE",
        &[
            F::GnssTime,
            F::GnssFix,
            F::NumSats,
            F::GnssPosEcef,
            F::GnssVelEcef,
            F::GnssPosAcc,
            F::GnssSpeedAcc,
            F::GnssTimeAcc,
        ],
    ),
    (
        "INS",
        &[
            F::InsTime,
            F::InsStatus,
            F::Ypr,
            F::InsPosLla,
            F::InsVelNed,
            F::AttUncertainty,
            F::PosUncertainty,
            F::VelUncertainty,
        ],
    ),
    (
        "INE",
        &[
            F::InsTime,
            F::InsStatus,
            F::Ypr,
            F::InsPosEcef,
            F::InsVelEcef,
            F::AttUncertainty,
            F::PosUncertainty,
            F::VelUncertainty,
        ],
    ),
    ("DTV", &[F::DeltaTheta, F::DeltaVel]),
];

/// Field layout of an async message keyword
pub fn ascii_layout(keyword: &str) -> Option<&'static [AsciiField]> {
    ASCII_MESSAGES
        .iter()
        .find(|(name, _)| *name == keyword)
        .map(|(_, layout)| *layout)
}

fn parse_error(token: &str) -> CodecError {
    CodecError::Parse {
        field: "measurement",
        value: token.to_string(),
    }
}

fn parse<T: FromStr>(token: &str) -> Result<T, CodecError> {
    token.trim().parse::<T>().map_err(|_| parse_error(token))
}

fn array<T: FromStr + Default + Copy, const N: usize>(tokens: &[String]) -> Result<[T; N], CodecError> {
    let mut out = [T::default(); N];
    for (slot, token) in out.iter_mut().zip(tokens) {
        *slot = parse(token)?;
    }
    Ok(out)
}

/// Seconds of week to nanoseconds
fn tow_nanos(token: &str) -> Result<u64, CodecError> {
    let seconds: f64 = parse(token)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(parse_error(token));
    }
    Ok((seconds * NANOS_PER_SECOND).round() as u64)
}

fn tow_seconds(nanos: u64) -> String {
    format!("{:.6}", nanos as f64 / NANOS_PER_SECOND)
}

/// Decode an async sentence
///
/// Unknown keywords produce a measurement with no groups so callers still see
/// the message arrive.
pub fn decode_ascii(sentence: &AsciiSentence) -> Result<Measurement, CodecError> {
    let mut measurement = Measurement::new(MeasurementSource::Ascii {
        header: sentence.header.clone(),
    });
    let Some(layout) = ascii_layout(sentence.keyword()) else {
        return Ok(measurement);
    };

    let expected: usize = layout.iter().map(|f| f.width()).sum();
    if sentence.fields.len() != expected {
        return Err(CodecError::FieldCount {
            expected,
            found: sentence.fields.len(),
        });
    }

    let mut offset = 0;
    for field in layout {
        let t = &sentence.fields[offset..offset + field.width()];
        offset += field.width();
        let m = &mut measurement;
        match field {
            F::Ypr => {
                let [yaw, pitch, roll] = array::<f32, 3>(t)?;
                m.attitude_mut().ypr = Some(Ypr { yaw, pitch, roll });
            }
            F::Quaternion => {
                let [x, y, z, w] = array::<f32, 4>(t)?;
                m.attitude_mut().quaternion = Some(Quaternion { x, y, z, w });
            }
            F::Mag => m.imu_mut().mag = Some(array(t)?),
            F::Accel => m.imu_mut().accel = Some(array(t)?),
            F::AngularRate => m.imu_mut().angular_rate = Some(array(t)?),
            F::LinAccelBody => m.attitude_mut().lin_accel_body = Some(array(t)?),
            F::LinAccelNed => m.attitude_mut().lin_accel_ned = Some(array(t)?),
            F::UncompMag => m.imu_mut().uncomp_mag = Some(array(t)?),
            F::UncompAccel => m.imu_mut().uncomp_accel = Some(array(t)?),
            F::UncompGyro => m.imu_mut().uncomp_gyro = Some(array(t)?),
            F::Temperature => m.imu_mut().temperature = Some(parse(&t[0])?),
            F::Pressure => m.imu_mut().pressure = Some(parse(&t[0])?),
            F::GnssTime => {
                let gnss = m.gnss_mut();
                gnss.tow = Some(tow_nanos(&t[0])?);
                gnss.week = Some(parse(&t[1])?);
            }
            F::GnssFix => m.gnss_mut().fix = Some(parse(&t[0])?),
            F::NumSats => m.gnss_mut().num_sats = Some(parse(&t[0])?),
            F::GnssPosLla => m.gnss_mut().pos_lla = Some(array::<f64, 3>(t)?),
            F::GnssPosEcef => m.gnss_mut().pos_ecef = Some(array::<f64, 3>(t)?),
            F::GnssVelNed => m.gnss_mut().vel_ned = Some(array(t)?),
            F::GnssVelEcef => m.gnss_mut().vel_ecef = Some(array(t)?),
            F::GnssPosAcc => m.gnss_mut().pos_u = Some(array(t)?),
            F::GnssSpeedAcc => m.gnss_mut().vel_u = Some(parse(&t[0])?),
            F::GnssTimeAcc => m.gnss_mut().time_u = Some(parse(&t[0])?),
            F::InsTime => {
                let time = m.time_mut();
                time.gps_tow = Some(tow_nanos(&t[0])?);
                time.gps_week = Some(parse(&t[1])?);
            }
            F::InsStatus => {
                let status =
                    u16::from_str_radix(t[0].trim(), 16).map_err(|_| parse_error(&t[0]))?;
                m.ins_mut().ins_status = Some(status);
            }
            F::InsPosLla => m.ins_mut().pos_lla = Some(array::<f64, 3>(t)?),
            F::InsPosEcef => m.ins_mut().pos_ecef = Some(array::<f64, 3>(t)?),
            F::InsVelNed => m.ins_mut().vel_ned = Some(array(t)?),
            F::InsVelEcef => m.ins_mut().vel_ecef = Some(array(t)?),
            F::AttUncertainty => m.ins_mut().att_u = Some(parse(&t[0])?),
            F::PosUncertainty => m.ins_mut().pos_u = Some(parse(&t[0])?),
            F::VelUncertainty => m.ins_mut().vel_u = Some(parse(&t[0])?),
            F::DeltaTheta => {
                let [delta_time, x, y, z] = array::<f32, 4>(t)?;
                m.imu_mut().delta_theta = Some(DeltaTheta {
                    delta_time,
                    delta_theta: [x, y, z],
                });
            }
            F::DeltaVel => m.imu_mut().delta_vel = Some(array(t)?),
        }
    }

    Ok(measurement)
}

fn push3(values: &mut Vec<String>, v: Vec3f) {
    values.extend(v.iter().map(ToString::to_string));
}

fn push3d(values: &mut Vec<String>, v: Vec3d) {
    values.extend(v.iter().map(|x| format!("{x:.9}")));
}

/// Encode a measurement as the async sentence for `keyword`
///
/// Missing values are written as zero. Returns `None` for unknown keywords.
pub fn encode_ascii(keyword: &str, measurement: &Measurement) -> Option<AsciiSentence> {
    let layout = ascii_layout(keyword)?;
    let time = measurement.time.clone().unwrap_or_default();
    let attitude = measurement.attitude.clone().unwrap_or_default();
    let imu = measurement.imu.clone().unwrap_or_default();
    let gnss = measurement.gnss.clone().unwrap_or_default();
    let ins = measurement.ins.clone().unwrap_or_default();

    let mut values: Vec<String> = Vec::new();
    for field in layout {
        match field {
            F::Ypr => {
                let ypr = attitude.ypr.unwrap_or_default();
                push3(&mut values, [ypr.yaw, ypr.pitch, ypr.roll]);
            }
            F::Quaternion => {
                let q = attitude.quaternion.unwrap_or_default();
                values.extend([q.x, q.y, q.z, q.w].iter().map(ToString::to_string));
            }
            F::Mag => push3(&mut values, imu.mag.unwrap_or_default()),
            F::Accel => push3(&mut values, imu.accel.unwrap_or_default()),
            F::AngularRate => push3(&mut values, imu.angular_rate.unwrap_or_default()),
            F::LinAccelBody => push3(&mut values, attitude.lin_accel_body.unwrap_or_default()),
            F::LinAccelNed => push3(&mut values, attitude.lin_accel_ned.unwrap_or_default()),
            F::UncompMag => push3(&mut values, imu.uncomp_mag.unwrap_or_default()),
            F::UncompAccel => push3(&mut values, imu.uncomp_accel.unwrap_or_default()),
            F::UncompGyro => push3(&mut values, imu.uncomp_gyro.unwrap_or_default()),
            F::Temperature => values.push(imu.temperature.unwrap_or_default().to_string()),
            F::Pressure => values.push(imu.pressure.unwrap_or_default().to_string()),
            F::GnssTime => {
                values.push(tow_seconds(gnss.tow.unwrap_or_default()));
                values.push(gnss.week.unwrap_or_default().to_string());
            }
            F::GnssFix => values.push(gnss.fix.unwrap_or_default().to_string()),
            F::NumSats => values.push(gnss.num_sats.unwrap_or_default().to_string()),
            F::GnssPosLla => push3d(&mut values, gnss.pos_lla.unwrap_or_default()),
            F::GnssPosEcef => push3d(&mut values, gnss.pos_ecef.unwrap_or_default()),
            F::GnssVelNed => push3(&mut values, gnss.vel_ned.unwrap_or_default()),
            F::GnssVelEcef => push3(&mut values, gnss.vel_ecef.unwrap_or_default()),
            F::GnssPosAcc => push3(&mut values, gnss.pos_u.unwrap_or_default()),
            F::GnssSpeedAcc => values.push(gnss.vel_u.unwrap_or_default().to_string()),
            F::GnssTimeAcc => values.push(gnss.time_u.unwrap_or_default().to_string()),
            F::InsTime => {
                values.push(tow_seconds(time.gps_tow.unwrap_or_default()));
                values.push(time.gps_week.unwrap_or_default().to_string());
            }
            F::InsStatus => values.push(format!("{:04X}", ins.ins_status.unwrap_or_default())),
            F::InsPosLla => push3d(&mut values, ins.pos_lla.unwrap_or_default()),
            F::InsPosEcef => push3d(&mut values, ins.pos_ecef.unwrap_or_default()),
            F::InsVelNed => push3(&mut values, ins.vel_ned.unwrap_or_default()),
            F::InsVelEcef => push3(&mut values, ins.vel_ecef.unwrap_or_default()),
            F::AttUncertainty => values.push(ins.att_u.unwrap_or_default().to_string()),
            F::PosUncertainty => values.push(ins.pos_u.unwrap_or_default().to_string()),
            F::VelUncertainty => values.push(ins.vel_u.unwrap_or_default().to_string()),
            F::DeltaTheta => {
                let dt = imu.delta_theta.unwrap_or_default();
                values.push(dt.delta_time.to_string());
                push3(&mut values, dt.delta_theta);
            }
            F::DeltaVel => push3(&mut values, imu.delta_vel.unwrap_or_default()),
        }
    }

    Some(AsciiSentence::new(keyword, values))
}
