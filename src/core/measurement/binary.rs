//! Binary packet payloads
//!
//! Fields are packed little-endian in group order, then in field-bit order
//! within a group. Common-group fields land in the semantic group they
//! describe, so `Common.Ypr` and `Attitude.Ypr` both fill `attitude.ypr`.

use super::{
    DeltaTheta, Dop, GnssTimeInfo, Mat3f, Measurement, MeasurementSource, Quaternion, TimeUtc,
    Vec3d, Vec3f, Ypr,
};
use crate::core::protocol::{BinaryHeader, OutputGroup};
use crate::core::register::CodecError;
use bytes::{Buf, BufMut};

fn set_bits(mask: u16) -> impl Iterator<Item = u8> {
    (0..16u8).filter(move |b| mask & (1 << b) != 0)
}

fn get_vec3f(buf: &mut &[u8]) -> Vec3f {
    [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()]
}

fn get_vec3d(buf: &mut &[u8]) -> Vec3d {
    [buf.get_f64_le(), buf.get_f64_le(), buf.get_f64_le()]
}

fn get_ypr(buf: &mut &[u8]) -> Ypr {
    Ypr {
        yaw: buf.get_f32_le(),
        pitch: buf.get_f32_le(),
        roll: buf.get_f32_le(),
    }
}

fn get_quaternion(buf: &mut &[u8]) -> Quaternion {
    Quaternion {
        x: buf.get_f32_le(),
        y: buf.get_f32_le(),
        z: buf.get_f32_le(),
        w: buf.get_f32_le(),
    }
}

fn get_time_utc(buf: &mut &[u8]) -> TimeUtc {
    TimeUtc {
        year: buf.get_i8(),
        month: buf.get_u8(),
        day: buf.get_u8(),
        hour: buf.get_u8(),
        minute: buf.get_u8(),
        second: buf.get_u8(),
        ms: buf.get_u16_le(),
    }
}

fn get_delta_theta(buf: &mut &[u8]) -> DeltaTheta {
    DeltaTheta {
        delta_time: buf.get_f32_le(),
        delta_theta: get_vec3f(buf),
    }
}

fn get_dcm(buf: &mut &[u8]) -> Mat3f {
    [get_vec3f(buf), get_vec3f(buf), get_vec3f(buf)]
}

fn get_dop(buf: &mut &[u8]) -> Dop {
    Dop {
        geometric: buf.get_f32_le(),
        position: buf.get_f32_le(),
        time: buf.get_f32_le(),
        vertical: buf.get_f32_le(),
        horizontal: buf.get_f32_le(),
        north: buf.get_f32_le(),
        east: buf.get_f32_le(),
    }
}

/// Decode a binary payload laid out by `header`
///
/// `output` is the binary output register whose configuration matched.
pub fn decode_binary(
    header: &BinaryHeader,
    output: u8,
    payload: &[u8],
) -> Result<Measurement, CodecError> {
    if payload.len() != header.payload_len() {
        return Err(CodecError::Truncated);
    }

    let mut m = Measurement::new(MeasurementSource::Binary {
        header: *header,
        output,
    });
    let mut buf = payload;

    for group in header.groups() {
        for bit in set_bits(header.mask(group)) {
            decode_field(group, bit, &mut buf, &mut m)?;
        }
    }

    Ok(m)
}

fn decode_field(
    group: OutputGroup,
    bit: u8,
    buf: &mut &[u8],
    m: &mut Measurement,
) -> Result<(), CodecError> {
    match (group, bit) {
        (OutputGroup::Common, 0) | (OutputGroup::Time, 0) => {
            m.time_mut().time_startup = Some(buf.get_u64_le());
        }
        (OutputGroup::Common, 1) | (OutputGroup::Time, 1) => {
            m.time_mut().time_gps = Some(buf.get_u64_le());
        }
        (OutputGroup::Common, 2) | (OutputGroup::Time, 4) => {
            m.time_mut().time_sync_in = Some(buf.get_u64_le());
        }
        (OutputGroup::Common, 3) | (OutputGroup::Attitude, 1) => {
            m.attitude_mut().ypr = Some(get_ypr(buf));
        }
        (OutputGroup::Common, 4) | (OutputGroup::Attitude, 2) => {
            m.attitude_mut().quaternion = Some(get_quaternion(buf));
        }
        (OutputGroup::Common, 5) | (OutputGroup::Imu, 10) => {
            m.imu_mut().angular_rate = Some(get_vec3f(buf));
        }
        (OutputGroup::Common, 6) | (OutputGroup::Ins, 1) => {
            m.ins_mut().pos_lla = Some(get_vec3d(buf));
        }
        (OutputGroup::Common, 7) | (OutputGroup::Ins, 4) => {
            m.ins_mut().vel_ned = Some(get_vec3f(buf));
        }
        (OutputGroup::Common, 8) | (OutputGroup::Imu, 9) => {
            m.imu_mut().accel = Some(get_vec3f(buf));
        }
        (OutputGroup::Common, 9) => {
            let imu = m.imu_mut();
            imu.uncomp_accel = Some(get_vec3f(buf));
            imu.uncomp_gyro = Some(get_vec3f(buf));
        }
        (OutputGroup::Common, 10) => {
            let imu = m.imu_mut();
            imu.mag = Some(get_vec3f(buf));
            imu.temperature = Some(buf.get_f32_le());
            imu.pressure = Some(buf.get_f32_le());
        }
        (OutputGroup::Common, 11) => {
            let imu = m.imu_mut();
            imu.delta_theta = Some(get_delta_theta(buf));
            imu.delta_vel = Some(get_vec3f(buf));
        }
        (OutputGroup::Common, 12) | (OutputGroup::Ins, 0) => {
            m.ins_mut().ins_status = Some(buf.get_u16_le());
        }
        (OutputGroup::Common, 13) | (OutputGroup::Time, 7) => {
            m.time_mut().sync_in_cnt = Some(buf.get_u32_le());
        }
        (OutputGroup::Common, 14) | (OutputGroup::Time, 5) => {
            m.time_mut().time_gps_pps = Some(buf.get_u64_le());
        }

        (OutputGroup::Time, 2) => m.time_mut().gps_tow = Some(buf.get_u64_le()),
        (OutputGroup::Time, 3) => m.time_mut().gps_week = Some(buf.get_u16_le()),
        (OutputGroup::Time, 6) => m.time_mut().time_utc = Some(get_time_utc(buf)),
        (OutputGroup::Time, 8) => m.time_mut().sync_out_cnt = Some(buf.get_u32_le()),
        (OutputGroup::Time, 9) => m.time_mut().time_status = Some(buf.get_u8()),

        (OutputGroup::Imu, 0) => m.imu_mut().imu_status = Some(buf.get_u16_le()),
        (OutputGroup::Imu, 1) => m.imu_mut().uncomp_mag = Some(get_vec3f(buf)),
        (OutputGroup::Imu, 2) => m.imu_mut().uncomp_accel = Some(get_vec3f(buf)),
        (OutputGroup::Imu, 3) => m.imu_mut().uncomp_gyro = Some(get_vec3f(buf)),
        (OutputGroup::Imu, 4) => m.imu_mut().temperature = Some(buf.get_f32_le()),
        (OutputGroup::Imu, 5) => m.imu_mut().pressure = Some(buf.get_f32_le()),
        (OutputGroup::Imu, 6) => m.imu_mut().delta_theta = Some(get_delta_theta(buf)),
        (OutputGroup::Imu, 7) => m.imu_mut().delta_vel = Some(get_vec3f(buf)),
        (OutputGroup::Imu, 8) => m.imu_mut().mag = Some(get_vec3f(buf)),
        (OutputGroup::Imu, 11) => m.imu_mut().sens_sat = Some(buf.get_u16_le()),

        (OutputGroup::Gnss, 0) => m.gnss_mut().time_utc = Some(get_time_utc(buf)),
        (OutputGroup::Gnss, 1) => m.gnss_mut().tow = Some(buf.get_u64_le()),
        (OutputGroup::Gnss, 2) => m.gnss_mut().week = Some(buf.get_u16_le()),
        (OutputGroup::Gnss, 3) => m.gnss_mut().num_sats = Some(buf.get_u8()),
        (OutputGroup::Gnss, 4) => m.gnss_mut().fix = Some(buf.get_u8()),
        (OutputGroup::Gnss, 5) => m.gnss_mut().pos_lla = Some(get_vec3d(buf)),
        (OutputGroup::Gnss, 6) => m.gnss_mut().pos_ecef = Some(get_vec3d(buf)),
        (OutputGroup::Gnss, 7) => m.gnss_mut().vel_ned = Some(get_vec3f(buf)),
        (OutputGroup::Gnss, 8) => m.gnss_mut().vel_ecef = Some(get_vec3f(buf)),
        (OutputGroup::Gnss, 9) => m.gnss_mut().pos_u = Some(get_vec3f(buf)),
        (OutputGroup::Gnss, 10) => m.gnss_mut().vel_u = Some(buf.get_f32_le()),
        (OutputGroup::Gnss, 11) => m.gnss_mut().time_u = Some(buf.get_f32_le()),
        (OutputGroup::Gnss, 12) => {
            m.gnss_mut().time_info = Some(GnssTimeInfo {
                status: buf.get_u8(),
                leap_seconds: buf.get_i8(),
            });
        }
        (OutputGroup::Gnss, 13) => m.gnss_mut().dop = Some(get_dop(buf)),

        (OutputGroup::Attitude, 3) => m.attitude_mut().dcm = Some(get_dcm(buf)),
        (OutputGroup::Attitude, 4) => m.attitude_mut().mag_ned = Some(get_vec3f(buf)),
        (OutputGroup::Attitude, 5) => m.attitude_mut().accel_ned = Some(get_vec3f(buf)),
        (OutputGroup::Attitude, 6) => m.attitude_mut().lin_accel_body = Some(get_vec3f(buf)),
        (OutputGroup::Attitude, 7) => m.attitude_mut().lin_accel_ned = Some(get_vec3f(buf)),
        (OutputGroup::Attitude, 8) => m.attitude_mut().ypr_u = Some(get_vec3f(buf)),

        (OutputGroup::Ins, 2) => m.ins_mut().pos_ecef = Some(get_vec3d(buf)),
        (OutputGroup::Ins, 3) => m.ins_mut().vel_body = Some(get_vec3f(buf)),
        (OutputGroup::Ins, 5) => m.ins_mut().vel_ecef = Some(get_vec3f(buf)),
        (OutputGroup::Ins, 6) => m.ins_mut().mag_ecef = Some(get_vec3f(buf)),
        (OutputGroup::Ins, 7) => m.ins_mut().accel_ecef = Some(get_vec3f(buf)),
        (OutputGroup::Ins, 8) => m.ins_mut().lin_accel_ecef = Some(get_vec3f(buf)),
        (OutputGroup::Ins, 9) => m.ins_mut().pos_u = Some(buf.get_f32_le()),
        (OutputGroup::Ins, 10) => m.ins_mut().vel_u = Some(buf.get_f32_le()),

        (group, bit) => {
            return Err(CodecError::InvalidValue {
                field: "binary field",
                value: format!("{group} bit {bit}"),
            })
        }
    }
    Ok(())
}

fn put_vec3f(out: &mut Vec<u8>, v: Option<Vec3f>) {
    for c in v.unwrap_or_default() {
        out.put_f32_le(c);
    }
}

fn put_vec3d(out: &mut Vec<u8>, v: Option<Vec3d>) {
    for c in v.unwrap_or_default() {
        out.put_f64_le(c);
    }
}

fn put_time_utc(out: &mut Vec<u8>, t: Option<TimeUtc>) {
    let t = t.unwrap_or_default();
    out.put_i8(t.year);
    out.put_u8(t.month);
    out.put_u8(t.day);
    out.put_u8(t.hour);
    out.put_u8(t.minute);
    out.put_u8(t.second);
    out.put_u16_le(t.ms);
}

fn put_delta_theta(out: &mut Vec<u8>, d: Option<DeltaTheta>) {
    let d = d.unwrap_or_default();
    out.put_f32_le(d.delta_time);
    put_vec3f(out, Some(d.delta_theta));
}

/// Pack the fields selected by `header` from `m`
///
/// Fields the measurement lacks are written as zero.
pub fn encode_binary_payload(header: &BinaryHeader, m: &Measurement) -> Vec<u8> {
    let time = m.time.clone().unwrap_or_default();
    let imu = m.imu.clone().unwrap_or_default();
    let gnss = m.gnss.clone().unwrap_or_default();
    let att = m.attitude.clone().unwrap_or_default();
    let ins = m.ins.clone().unwrap_or_default();

    let mut out = Vec::with_capacity(header.payload_len());
    for group in header.groups() {
        for bit in set_bits(header.mask(group)) {
            let o = &mut out;
            match (group, bit) {
                (OutputGroup::Common, 0) | (OutputGroup::Time, 0) => {
                    o.put_u64_le(time.time_startup.unwrap_or_default());
                }
                (OutputGroup::Common, 1) | (OutputGroup::Time, 1) => {
                    o.put_u64_le(time.time_gps.unwrap_or_default());
                }
                (OutputGroup::Common, 2) | (OutputGroup::Time, 4) => {
                    o.put_u64_le(time.time_sync_in.unwrap_or_default());
                }
                (OutputGroup::Common, 3) | (OutputGroup::Attitude, 1) => {
                    let ypr = att.ypr.unwrap_or_default();
                    put_vec3f(o, Some([ypr.yaw, ypr.pitch, ypr.roll]));
                }
                (OutputGroup::Common, 4) | (OutputGroup::Attitude, 2) => {
                    let q = att.quaternion.unwrap_or_default();
                    for c in [q.x, q.y, q.z, q.w] {
                        o.put_f32_le(c);
                    }
                }
                (OutputGroup::Common, 5) | (OutputGroup::Imu, 10) => put_vec3f(o, imu.angular_rate),
                (OutputGroup::Common, 6) | (OutputGroup::Ins, 1) => put_vec3d(o, ins.pos_lla),
                (OutputGroup::Common, 7) | (OutputGroup::Ins, 4) => put_vec3f(o, ins.vel_ned),
                (OutputGroup::Common, 8) | (OutputGroup::Imu, 9) => put_vec3f(o, imu.accel),
                (OutputGroup::Common, 9) => {
                    put_vec3f(o, imu.uncomp_accel);
                    put_vec3f(o, imu.uncomp_gyro);
                }
                (OutputGroup::Common, 10) => {
                    put_vec3f(o, imu.mag);
                    o.put_f32_le(imu.temperature.unwrap_or_default());
                    o.put_f32_le(imu.pressure.unwrap_or_default());
                }
                (OutputGroup::Common, 11) => {
                    put_delta_theta(o, imu.delta_theta);
                    put_vec3f(o, imu.delta_vel);
                }
                (OutputGroup::Common, 12) | (OutputGroup::Ins, 0) => {
                    o.put_u16_le(ins.ins_status.unwrap_or_default());
                }
                (OutputGroup::Common, 13) | (OutputGroup::Time, 7) => {
                    o.put_u32_le(time.sync_in_cnt.unwrap_or_default());
                }
                (OutputGroup::Common, 14) | (OutputGroup::Time, 5) => {
                    o.put_u64_le(time.time_gps_pps.unwrap_or_default());
                }

                (OutputGroup::Time, 2) => o.put_u64_le(time.gps_tow.unwrap_or_default()),
                (OutputGroup::Time, 3) => o.put_u16_le(time.gps_week.unwrap_or_default()),
                (OutputGroup::Time, 6) => put_time_utc(o, time.time_utc),
                (OutputGroup::Time, 8) => o.put_u32_le(time.sync_out_cnt.unwrap_or_default()),
                (OutputGroup::Time, 9) => o.put_u8(time.time_status.unwrap_or_default()),

                (OutputGroup::Imu, 0) => o.put_u16_le(imu.imu_status.unwrap_or_default()),
                (OutputGroup::Imu, 1) => put_vec3f(o, imu.uncomp_mag),
                (OutputGroup::Imu, 2) => put_vec3f(o, imu.uncomp_accel),
                (OutputGroup::Imu, 3) => put_vec3f(o, imu.uncomp_gyro),
                (OutputGroup::Imu, 4) => o.put_f32_le(imu.temperature.unwrap_or_default()),
                (OutputGroup::Imu, 5) => o.put_f32_le(imu.pressure.unwrap_or_default()),
                (OutputGroup::Imu, 6) => put_delta_theta(o, imu.delta_theta),
                (OutputGroup::Imu, 7) => put_vec3f(o, imu.delta_vel),
                (OutputGroup::Imu, 8) => put_vec3f(o, imu.mag),
                (OutputGroup::Imu, 11) => o.put_u16_le(imu.sens_sat.unwrap_or_default()),

                (OutputGroup::Gnss, 0) => put_time_utc(o, gnss.time_utc),
                (OutputGroup::Gnss, 1) => o.put_u64_le(gnss.tow.unwrap_or_default()),
                (OutputGroup::Gnss, 2) => o.put_u16_le(gnss.week.unwrap_or_default()),
                (OutputGroup::Gnss, 3) => o.put_u8(gnss.num_sats.unwrap_or_default()),
                (OutputGroup::Gnss, 4) => o.put_u8(gnss.fix.unwrap_or_default()),
                (OutputGroup::Gnss, 5) => put_vec3d(o, gnss.pos_lla),
                (OutputGroup::Gnss, 6) => put_vec3d(o, gnss.pos_ecef),
                (OutputGroup::Gnss, 7) => put_vec3f(o, gnss.vel_ned),
                (OutputGroup::Gnss, 8) => put_vec3f(o, gnss.vel_ecef),
                (OutputGroup::Gnss, 9) => put_vec3f(o, gnss.pos_u),
                (OutputGroup::Gnss, 10) => o.put_f32_le(gnss.vel_u.unwrap_or_default()),
                (OutputGroup::Gnss, 11) => o.put_f32_le(gnss.time_u.unwrap_or_default()),
                (OutputGroup::Gnss, 12) => {
                    let info = gnss.time_info.unwrap_or_default();
                    o.put_u8(info.status);
                    o.put_i8(info.leap_seconds);
                }
                (OutputGroup::Gnss, 13) => {
                    let d = gnss.dop.unwrap_or_default();
                    for c in [d.geometric, d.position, d.time, d.vertical, d.horizontal, d.north, d.east] {
                        o.put_f32_le(c);
                    }
                }

                (OutputGroup::Attitude, 3) => {
                    for row in att.dcm.unwrap_or_default() {
                        put_vec3f(o, Some(row));
                    }
                }
                (OutputGroup::Attitude, 4) => put_vec3f(o, att.mag_ned),
                (OutputGroup::Attitude, 5) => put_vec3f(o, att.accel_ned),
                (OutputGroup::Attitude, 6) => put_vec3f(o, att.lin_accel_body),
                (OutputGroup::Attitude, 7) => put_vec3f(o, att.lin_accel_ned),
                (OutputGroup::Attitude, 8) => put_vec3f(o, att.ypr_u),

                (OutputGroup::Ins, 2) => put_vec3d(o, ins.pos_ecef),
                (OutputGroup::Ins, 3) => put_vec3f(o, ins.vel_body),
                (OutputGroup::Ins, 5) => put_vec3f(o, ins.vel_ecef),
                (OutputGroup::Ins, 6) => put_vec3f(o, ins.mag_ecef),
                (OutputGroup::Ins, 7) => put_vec3f(o, ins.accel_ecef),
                (OutputGroup::Ins, 8) => put_vec3f(o, ins.lin_accel_ecef),
                (OutputGroup::Ins, 9) => o.put_f32_le(ins.pos_u.unwrap_or_default()),
                (OutputGroup::Ins, 10) => o.put_f32_le(ins.vel_u.unwrap_or_default()),

                // Unknown bits never pass header validation; keep the size right anyway.
                (group, bit) => o.put_bytes(0, group.field_size(bit).unwrap_or(0)),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::measurement::{AttitudeGroup, ImuGroup, TimeGroup};

    fn masks(pairs: &[(OutputGroup, u16)]) -> BinaryHeader {
        let mut masks = [0u16; 6];
        for (group, mask) in pairs {
            masks[group.index()] = *mask;
        }
        BinaryHeader::new(masks)
    }

    #[test]
    fn test_common_fields_fill_semantic_groups() {
        // time startup, ypr, angular rate
        let header = masks(&[(OutputGroup::Common, 0b10_1001)]);
        let mut payload = Vec::new();
        payload.put_u64_le(123_456_789);
        for v in [10.5f32, -2.25, 0.125, 0.01, 0.02, 0.03] {
            payload.put_f32_le(v);
        }

        let m = decode_binary(&header, 75, &payload).unwrap();
        assert_eq!(m.time.as_ref().unwrap().time_startup, Some(123_456_789));
        assert_eq!(
            m.attitude.as_ref().unwrap().ypr,
            Some(Ypr { yaw: 10.5, pitch: -2.25, roll: 0.125 })
        );
        assert_eq!(m.imu.as_ref().unwrap().angular_rate, Some([0.01, 0.02, 0.03]));
        assert!(m.gnss.is_none());
        assert!(m.ins.is_none());
        assert!(m.is_binary());
    }

    #[test]
    fn test_exactly_the_enabled_fields_are_present() {
        let header = masks(&[(OutputGroup::Imu, 1 << 4), (OutputGroup::Time, 1 << 3)]);
        let payload = encode_binary_payload(&header, &Measurement::new(MeasurementSource::Ascii {
            header: String::new(),
        }));
        let m = decode_binary(&header, 76, &payload).unwrap();
        assert_eq!(
            m.imu,
            Some(ImuGroup {
                temperature: Some(0.0),
                ..ImuGroup::default()
            })
        );
        assert_eq!(
            m.time,
            Some(TimeGroup {
                gps_week: Some(0),
                ..TimeGroup::default()
            })
        );
        assert!(m.attitude.is_none());
    }

    #[test]
    fn test_encode_decode_attitude_and_ins() {
        let header = masks(&[
            (OutputGroup::Attitude, (1 << 2) | (1 << 3)),
            (OutputGroup::Ins, (1 << 0) | (1 << 1)),
        ]);
        let mut m = Measurement::new(MeasurementSource::Ascii {
            header: String::new(),
        });
        m.attitude = Some(AttitudeGroup {
            quaternion: Some(Quaternion { x: 0.0, y: 0.5, z: -0.5, w: 0.70710677 }),
            dcm: Some([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
            ..AttitudeGroup::default()
        });
        m.ins_mut().ins_status = Some(0x0102);
        m.ins_mut().pos_lla = Some([37.5, -122.25, 12.0]);

        let payload = encode_binary_payload(&header, &m);
        assert_eq!(payload.len(), header.payload_len());
        let decoded = decode_binary(&header, 77, &payload).unwrap();
        assert_eq!(decoded.attitude, m.attitude);
        assert_eq!(decoded.ins, m.ins);
    }

    #[test]
    fn test_short_payload_is_rejected() {
        let header = masks(&[(OutputGroup::Attitude, 1 << 1)]);
        assert!(matches!(
            decode_binary(&header, 75, &[0u8; 8]),
            Err(CodecError::Truncated)
        ));
    }
}
