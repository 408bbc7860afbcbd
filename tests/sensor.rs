//! Sensor behaviour against the in-process simulator

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vnlink_core::core::command::{CommandState, SensorError};
use vnlink_core::core::measurement::{MeasurementSource, Quaternion, Ypr};
use vnlink_core::core::protocol::{AsciiSentence, OutputGroup};
use vnlink_core::core::register::{AsyncMode, BaudRate, BaudRateRegister, SerialPortSelect};
use vnlink_core::core::simulator::{FaultConfig, SimulatedSensor, SimulatorHandle};
use vnlink_core::{
    BinaryOutputGroup, ByteSink, ChecksumMode, CommandError, CommandRequest, ConnectionError,
    ConnectionState, ReceivedByteBuffer, Register, Sensor, SensorConfig,
};

fn config(timeout_ms: u64, attempts: u32) -> SensorConfig {
    let mut config = SensorConfig::default();
    config.command.timeout_ms = timeout_ms;
    config.command.attempts = attempts;
    config
}

async fn connected(sim: SimulatedSensor, config: SensorConfig) -> (Sensor, SimulatorHandle) {
    let handle = sim.handle();
    let mut sensor = Sensor::new(config);
    sensor.connect_with_transport(Box::new(sim)).await.unwrap();
    (sensor, handle)
}

#[tokio::test]
async fn command_is_matched_amid_async_frames() {
    let sim = SimulatedSensor::new(115_200).with_faults(FaultConfig {
        async_frames_before_response: 50,
        ..FaultConfig::default()
    });
    let (mut sensor, handle) = connected(sim, config(500, 3)).await;
    handle.set_async_ascii(Some("YPR"));

    let mut model = Register::from_id(1).unwrap();
    sensor.read_register(&mut model).await.unwrap();
    match &model {
        Register::Model(m) => assert_eq!(m.model, "VN-300-SIM"),
        other => panic!("unexpected register {other:?}"),
    }

    let measurement = sensor
        .next_measurement(Duration::from_secs(1))
        .await
        .expect("async output queued");
    assert!(measurement.matches_message("VNYPR"));
    assert!(measurement.attitude.as_ref().and_then(|a| a.ypr).is_some());
    assert!(sensor.listener().stats().queued >= 50);

    sensor.disconnect().await;
    assert!(!sensor.has_measurement());
}

#[tokio::test(start_paused = true)]
async fn silent_sensor_times_out_after_all_attempts() {
    let sim = SimulatedSensor::new(115_200);
    let (mut sensor, handle) = connected(sim, config(100, 3)).await;
    handle.set_silent(true);

    let start = Instant::now();
    let mut model = Register::from_id(1).unwrap();
    let result = sensor.read_register(&mut model).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(CommandError::Timeout { attempts: 3 })));
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(310), "{elapsed:?}");
    assert_eq!(handle.received().len(), 3);

    sensor.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn sensor_error_fails_the_command_immediately() {
    let (mut sensor, _handle) = connected(SimulatedSensor::new(115_200), config(100, 3)).await;

    let start = Instant::now();
    let result = sensor.execute(CommandRequest::ReadRegister { id: 200 }).await;
    assert!(matches!(
        result,
        Err(CommandError::Sensor(SensorError::InvalidRegister))
    ));
    assert!(start.elapsed() < Duration::from_millis(100));

    sensor.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn auto_connect_finds_the_device_rate() {
    let sim = SimulatedSensor::new(230_400);
    let handle = sim.handle();
    let mut sensor = Sensor::new(SensorConfig::default());

    let baud = sensor
        .auto_connect_with_transport(Box::new(sim))
        .await
        .unwrap();
    assert_eq!(baud, 230_400);
    assert_eq!(sensor.baud_rate(), 230_400);
    assert_eq!(handle.host_baud(), 230_400);
    assert_eq!(sensor.state(), ConnectionState::Connected);

    sensor.verify_connectivity().await.unwrap();
    sensor.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn auto_connect_gives_up_after_every_rate() {
    let sim = SimulatedSensor::new(115_200).with_faults(FaultConfig {
        silent: true,
        ..FaultConfig::default()
    });
    let handle = sim.handle();
    let config = SensorConfig::default();
    let candidates = config.connection.auto_connect_baud_rates.len() as u32;
    let per_rate = Duration::from_millis(config.connection.auto_connect_timeout_ms);
    let mut sensor = Sensor::new(config);

    let start = Instant::now();
    let result = sensor.auto_connect_with_transport(Box::new(sim)).await;

    assert!(matches!(result, Err(ConnectionError::NoResponse(_))));
    assert!(start.elapsed() >= per_rate * candidates);
    assert_eq!(sensor.state(), ConnectionState::Disconnected);
    assert!(!handle.is_open());
}

#[tokio::test]
async fn binary_output_write_enables_decoding() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;

    let output = BinaryOutputGroup::new(AsyncMode::SERIAL_1, 4)
        .with_fields(OutputGroup::Common, (1 << 3) | (1 << 5))
        .with_fields(OutputGroup::Imu, 1 << 4);
    sensor
        .write_register(&Register::BinaryOutput1(output))
        .await
        .unwrap();
    assert_eq!(sensor.listener().binary_outputs(), vec![(75, output)]);
    assert_eq!(handle.register(75), Some(Register::BinaryOutput1(output)));

    handle.set_async_per_read(1);
    let measurement = sensor
        .next_measurement(Duration::from_secs(1))
        .await
        .expect("binary output queued");
    assert!(matches!(
        measurement.source,
        MeasurementSource::Binary { output: 75, .. }
    ));
    let imu = measurement.imu.expect("imu group");
    assert_eq!(imu.temperature, Some(25.0));
    assert!(imu.angular_rate.is_some());
    assert!(measurement.attitude.and_then(|a| a.ypr).is_some());

    sensor.disconnect().await;
}

#[tokio::test]
async fn unregistered_binary_output_is_counted_and_dropped() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;

    // written without going through write_register, so no layout is registered
    let output = BinaryOutputGroup::new(AsyncMode::SERIAL_1, 1).with_fields(OutputGroup::Common, 1 << 3);
    let write = vnlink_core::core::register::write_sentence(&Register::BinaryOutput2(output)).unwrap();
    sensor
        .execute(CommandRequest::WriteRegister(Register::BinaryOutput2(output)))
        .await
        .unwrap();
    assert_eq!(handle.received().last(), Some(&write));

    handle.set_async_per_read(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sensor.has_measurement());
    assert!(sensor.listener().stats().unmatched_binary > 0);

    sensor.disconnect().await;
}

#[tokio::test]
async fn baud_rate_change_follows_the_device() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;

    sensor.change_baud_rate(BaudRate::B921600).await.unwrap();
    assert_eq!(handle.device_baud(), 921_600);
    assert_eq!(handle.host_baud(), 921_600);
    assert_eq!(sensor.baud_rate(), 921_600);

    let mut reg = Register::from_id(5).unwrap();
    sensor.read_register(&mut reg).await.unwrap();
    assert_eq!(
        reg,
        Register::BaudRate(BaudRateRegister {
            baud_rate: BaudRate::B921600,
            serial_port: SerialPortSelect::Active,
        })
    );

    sensor.disconnect().await;
}

#[tokio::test]
async fn action_commands_are_acknowledged() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;

    sensor.write_settings().await.unwrap();
    sensor.known_magnetic_disturbance(true).await.unwrap();
    sensor.known_acceleration_disturbance(false).await.unwrap();
    sensor.set_initial_heading(-42.5).await.unwrap();
    sensor.set_async_output_enabled(false).await.unwrap();
    sensor.reset().await.unwrap();

    let keywords: Vec<String> = handle
        .received()
        .iter()
        .map(|s| s.keyword().to_string())
        .collect();
    assert_eq!(keywords, ["WNV", "KMD", "KAD", "SIH", "ASY", "RST"]);
    assert_eq!(handle.received()[3].field(0), Some("-042.500"));

    sensor.disconnect().await;
}

#[tokio::test]
async fn read_only_register_write_is_refused_locally() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;

    let result = sensor.write_register(&Register::from_id(3).unwrap()).await;
    assert!(matches!(result, Err(CommandError::Codec(_))));
    assert!(handle.received().is_empty());

    sensor.disconnect().await;
}

#[tokio::test]
async fn attitude_seeding_and_filter_bias_are_acknowledged() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;

    sensor
        .set_initial_heading_ypr(Ypr { yaw: 10.0, pitch: -2.5, roll: 0.0 })
        .await
        .unwrap();
    sensor
        .set_initial_heading_quaternion(Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 })
        .await
        .unwrap();
    sensor.set_filter_bias().await.unwrap();

    let received = handle.received();
    let keywords: Vec<&str> = received.iter().map(|s| s.keyword()).collect();
    assert_eq!(keywords, ["SIH", "SIH", "SFB"]);
    assert_eq!(received[0].fields, vec!["+010.000", "-002.500", "+000.000"]);
    assert_eq!(received[1].fields.len(), 4);
    assert_eq!(received[1].field(3), Some("+1.000000"));
    assert!(received[2].fields.is_empty());

    sensor.disconnect().await;
}

#[tokio::test]
async fn serial_send_bypasses_the_dispatcher() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;

    let raw = AsciiSentence::new("WNV", Vec::<String>::new()).to_bytes(ChecksumMode::Crc16);
    sensor.serial_send(&raw).await.unwrap();
    assert_eq!(handle.received().len(), 1);
    assert_eq!(handle.received()[0].keyword(), "WNV");
    assert!(sensor.last_command().is_none());

    // the unrequested echo does not break the next command
    sensor.write_settings().await.unwrap();

    sensor.disconnect().await;
    assert!(matches!(
        sensor.serial_send(&raw).await,
        Err(ConnectionError::NotConnected)
    ));
}

#[tokio::test]
async fn discarded_bytes_reach_the_skipped_byte_sink() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(500, 3)).await;
    let skipped = Arc::new(ReceivedByteBuffer::new(64));
    let sink: Arc<dyn ByteSink> = skipped.clone();
    sensor.register_skipped_byte_buffer(Arc::clone(&sink));

    handle.inject(b"line noise");
    let mut model = Register::from_id(1).unwrap();
    sensor.read_register(&mut model).await.unwrap();
    assert_eq!(skipped.take_all(), b"line noise".to_vec());

    sensor.deregister_skipped_byte_buffer(&sink);
    handle.inject(b"more");
    sensor.read_register(&mut model).await.unwrap();
    assert!(skipped.is_empty());

    sensor.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn stray_sync_byte_does_not_hold_responses() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(100, 1)).await;

    // sync byte and a header that promises a long binary packet
    handle.inject(&[0xFA, 0x01, 0xFF, 0x7F]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut model = Register::from_id(1).unwrap();
    sensor.read_register(&mut model).await.unwrap();
    sensor.read_register(&mut model).await.unwrap();
    assert_eq!(handle.received().len(), 2);
    assert_eq!(sensor.stats().await.decoder.frames, 2);

    sensor.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn unsolicited_sensor_error_is_queued_not_raised() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(100, 3)).await;

    handle.inject(&AsciiSentence::new("ERR", ["0A"]).to_bytes(ChecksumMode::Crc16));
    let reported = sensor
        .next_async_error(Duration::from_secs(1))
        .await
        .expect("error queued");
    assert_eq!(reported.error, SensorError::WatchdogReset);
    assert!(!sensor.has_async_error());

    let mut model = Register::from_id(1).unwrap();
    sensor.read_register(&mut model).await.unwrap();
    assert_eq!(sensor.listener().stats().async_errors, 1);

    sensor.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_register_response_marks_the_command_failed() {
    let (mut sensor, handle) = connected(SimulatedSensor::new(115_200), config(100, 1)).await;
    handle.set_silent(true);

    // a Yaw Pitch Roll response with one value instead of three
    let reply = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.inject(&AsciiSentence::new("RRG", ["8", "1.0"]).to_bytes(ChecksumMode::Crc16));
    };
    let mut ypr = Register::from_id(8).unwrap();
    let (result, ()) = tokio::join!(sensor.read_register(&mut ypr), reply);

    assert!(matches!(result, Err(CommandError::Codec(_))));
    assert_eq!(
        sensor.last_command().map(|c| c.state),
        Some(CommandState::Failed)
    );

    sensor.disconnect().await;
}
