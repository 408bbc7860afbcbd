//! Virtual sensor
//!
//! [`SimulatedSensor`] implements [`Transport`] and answers the command and
//! bootloader protocols from an in-memory register store. Tests keep a
//! [`SimulatorHandle`] to script faults and inspect what the host sent after
//! the transport itself has been handed to a `Sensor`.

use crate::core::firmware::{BOOTLOADER_KEYWORD, ENTER_KEYWORD};
use crate::core::measurement::{
    encode_ascii, encode_binary_payload, Measurement, MeasurementSource, Quaternion, Ypr,
};
use crate::core::protocol::checksum::crc32;
use crate::core::protocol::framing::encode_binary;
use crate::core::protocol::{AsciiSentence, BinaryHeader, ChecksumMode, FrameDecoder, FrameKind};
use crate::core::register::{
    self, AsyncDataOutputType, BaudRateRegister, FirmwareVersion, HardwareVersion, Model,
    Register, SerialNumber,
};
use crate::core::transport::{is_supported_baud_rate, ConnectionError, Transport, TransportStats};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Port name reported by the simulator
pub const SIMULATOR_PORT: &str = "sim";

/// Fault injection settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultConfig {
    /// Ignore every command
    pub silent: bool,
    /// Swallow every n-th bootloader chunk acknowledgement (the data is kept)
    pub drop_every_nth_ack: Option<u32>,
    /// Async frames emitted just before each command response
    pub async_frames_before_response: usize,
    /// Largest byte span returned by one `receive`
    pub max_read: Option<usize>,
}

#[derive(Debug)]
struct Bootloader {
    processor: String,
    firmware_baud: u32,
    image: Vec<u8>,
}

#[derive(Debug)]
struct DeviceState {
    open: bool,
    host_baud: u32,
    device_baud: u32,
    pending_baud: Option<u32>,
    checksum: ChecksumMode,
    faults: FaultConfig,
    registers: BTreeMap<u8, Register>,
    decoder: FrameDecoder,
    outbox: VecDeque<u8>,
    received: Vec<AsciiSentence>,
    async_ascii: Option<&'static str>,
    async_binary: Option<BinaryHeader>,
    async_per_read: usize,
    sample: u32,
    bootloader: Option<Bootloader>,
    acks: u32,
    chunk_writes: u32,
    flashed: HashMap<String, Vec<u8>>,
    stats: TransportStats,
}

impl DeviceState {
    fn linked(&self) -> bool {
        self.open && self.host_baud == self.device_baud
    }

    /// Switch the device rate once everything queued at the old rate is out
    fn switch_baud(&mut self, baud: u32) {
        self.pending_baud = Some(baud);
        self.apply_pending_baud();
    }

    fn apply_pending_baud(&mut self) {
        if self.outbox.is_empty() {
            if let Some(baud) = self.pending_baud.take() {
                self.device_baud = baud;
            }
        }
    }

    fn emit(&mut self, sentence: &AsciiSentence) {
        self.outbox.extend(sentence.to_bytes(self.checksum));
    }

    fn next_sample(&mut self) -> Measurement {
        self.sample = self.sample.wrapping_add(1);
        let t = self.sample as f32;
        let mut m = Measurement::new(MeasurementSource::Ascii {
            header: String::new(),
        });
        m.attitude_mut().ypr = Some(Ypr {
            yaw: t,
            pitch: 0.5,
            roll: -0.25,
        });
        m.attitude_mut().quaternion = Some(Quaternion {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        });
        m.imu_mut().mag = Some([0.2, 0.0, 0.4]);
        m.imu_mut().accel = Some([0.0, 0.0, -9.81]);
        m.imu_mut().angular_rate = Some([0.0, 0.001 * t, 0.0]);
        m.imu_mut().temperature = Some(25.0);
        m.imu_mut().pressure = Some(101.3);
        m
    }

    fn emit_async(&mut self, count: usize) {
        for _ in 0..count {
            if let Some(keyword) = self.async_ascii {
                let sample = self.next_sample();
                if let Some(sentence) = encode_ascii(keyword, &sample) {
                    self.emit(&sentence);
                }
            }
            if let Some(header) = self.async_binary {
                let sample = self.next_sample();
                let packet = encode_binary(&header, &encode_binary_payload(&header, &sample));
                self.outbox.extend(packet);
            }
        }
    }

    fn respond(&mut self, sentence: &AsciiSentence) {
        self.emit_async(self.faults.async_frames_before_response);
        self.emit(sentence);
    }

    fn error(&mut self, code: u8) {
        self.respond(&AsciiSentence::new("ERR", [format!("{code:02X}")]));
    }

    fn handle(&mut self, sentence: AsciiSentence) {
        self.received.push(sentence.clone());
        if self.faults.silent {
            return;
        }
        if self.bootloader.is_some() {
            self.handle_bootloader(&sentence);
            return;
        }

        match sentence.keyword() {
            "RRG" => self.read_register(&sentence),
            "WRG" => self.write_register(&sentence),
            "WNV" | "RFS" | "RST" | "ASY" | "KMD" | "KAD" | "SIH" | "SFB" => {
                if sentence.keyword() == "ASY" {
                    self.async_per_read = match sentence.field(0) {
                        Some("0") => 0,
                        _ => self.async_per_read.max(1),
                    };
                }
                if sentence.keyword() == "RFS" {
                    self.registers = default_registers();
                }
                self.respond(&sentence);
            }
            ENTER_KEYWORD => self.enter_bootloader(&sentence),
            _ => self.error(4),
        }
    }

    fn read_register(&mut self, sentence: &AsciiSentence) {
        let id = register::response_register_id(sentence);
        let response = id
            .and_then(|id| self.registers.get(&id))
            .and_then(|reg| register::response_sentence(reg).ok());
        match response {
            Some(response) => self.respond(&response),
            None => self.error(8),
        }
    }

    fn write_register(&mut self, sentence: &AsciiSentence) {
        let Some(id) = register::response_register_id(sentence) else {
            return self.error(7);
        };
        let Some(current) = self.registers.get(&id) else {
            return self.error(8);
        };
        if !current.is_writable() {
            return self.error(9);
        }
        let value = match register::decode_response(id, sentence) {
            Ok(value) => value,
            Err(_) => return self.error(7),
        };
        let Ok(echo) = register::write_sentence(&value) else {
            return self.error(7);
        };

        self.respond(&echo);
        match &value {
            Register::BaudRate(BaudRateRegister { baud_rate, .. }) => {
                self.switch_baud(baud_rate.value());
            }
            Register::AsyncDataOutputType(AsyncDataOutputType { ador, .. }) => {
                self.async_ascii = ador.keyword();
            }
            _ => {}
        }
        if let Some(output) = value.binary_output() {
            self.async_binary = (!output.async_mode.is_empty() && !output.header.is_empty())
                .then_some(output.header);
        }
        self.registers.insert(id, value);
    }

    fn enter_bootloader(&mut self, sentence: &AsciiSentence) {
        let processor = sentence.field(0).unwrap_or_default().to_string();
        let baud = sentence
            .field(1)
            .and_then(|b| b.parse().ok())
            .filter(|b| is_supported_baud_rate(*b));
        let Some(baud) = baud else {
            return self.error(7);
        };

        self.respond(&AsciiSentence::new(BOOTLOADER_KEYWORD, ["RDY", processor.as_str()]));
        self.bootloader = Some(Bootloader {
            processor,
            firmware_baud: self.device_baud,
            image: Vec::new(),
        });
        self.switch_baud(baud);
    }

    fn handle_bootloader(&mut self, sentence: &AsciiSentence) {
        if sentence.keyword() != BOOTLOADER_KEYWORD {
            return;
        }
        let Some(boot) = self.bootloader.as_mut() else {
            return;
        };
        let reply = |fields: &[&str]| AsciiSentence::new(BOOTLOADER_KEYWORD, fields.iter().copied());

        match sentence.field(0) {
            Some("W") => {
                self.chunk_writes += 1;
                let offset_field = sentence.field(1).unwrap_or_default().to_string();
                let offset = u32::from_str_radix(&offset_field, 16).ok().map(|o| o as usize);
                let data = sentence.field(2).and_then(|h| hex::decode(h).ok());
                let (Some(offset), Some(data)) = (offset, data) else {
                    let nak = reply(&["NAK", offset_field.as_str(), "FORMAT"]);
                    return self.emit(&nak);
                };

                let written = boot.image.len();
                let accepted = if offset == written {
                    boot.image.extend_from_slice(&data);
                    true
                } else {
                    // A resend of the chunk whose acknowledgement was lost
                    offset + data.len() == written && boot.image[offset..] == data[..]
                };
                if !accepted {
                    let nak = reply(&["NAK", offset_field.as_str(), "ORDER"]);
                    return self.emit(&nak);
                }

                self.acks += 1;
                if let Some(n) = self.faults.drop_every_nth_ack {
                    if n > 0 && self.acks % n == 0 {
                        trace!(offset, "simulator dropping chunk acknowledgement");
                        return;
                    }
                }
                let ack = reply(&["ACK", offset_field.as_str()]);
                self.emit(&ack);
            }
            Some("V") => {
                let expected_crc = format!("{:08X}", crc32(&boot.image));
                let size_ok = sentence.field(1) == Some(boot.image.len().to_string().as_str());
                let verdict = if !size_ok {
                    reply(&["VERR", "SIZE"])
                } else if sentence.field(2) != Some(expected_crc.as_str()) {
                    reply(&["VERR", "CRC"])
                } else {
                    reply(&["VOK"])
                };
                self.emit(&verdict);
            }
            Some("X") => {
                self.emit(&reply(&["XOK"]));
                if let Some(boot) = self.bootloader.take() {
                    self.switch_baud(boot.firmware_baud);
                    self.flashed.insert(boot.processor, boot.image);
                }
            }
            _ => {}
        }
    }
}

fn default_registers() -> BTreeMap<u8, Register> {
    let mut registers = BTreeMap::new();
    let known = [
        Register::Model(Model {
            model: "VN-300-SIM".to_string(),
        }),
        Register::HardwareVersion(HardwareVersion {
            revision: 2,
            minor: 0,
        }),
        Register::SerialNumber(SerialNumber { serial_num: 1_234_567 }),
        Register::FirmwareVersion(FirmwareVersion {
            version: "3.1.0.0".to_string(),
        }),
    ];
    for reg in known {
        registers.insert(reg.id(), reg);
    }
    for &id in Register::known_ids() {
        if let Some(reg) = Register::from_id(id) {
            registers.entry(id).or_insert(reg);
        }
    }
    registers
}

/// Shared view of a simulated device
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatorHandle {
    /// Replace the fault settings
    pub fn set_faults(&self, faults: FaultConfig) {
        self.state.lock().faults = faults;
    }

    /// Stop or resume answering
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().faults.silent = silent;
    }

    /// Stream async ASCII output (`Some("YPR")`) or stop it
    pub fn set_async_ascii(&self, keyword: Option<&'static str>) {
        let mut state = self.state.lock();
        state.async_ascii = keyword;
        if keyword.is_some() {
            state.async_per_read = state.async_per_read.max(1);
        }
    }

    /// Async frames emitted per `receive`
    pub fn set_async_per_read(&self, count: usize) {
        self.state.lock().async_per_read = count;
    }

    /// Queue raw bytes for the host
    pub fn inject(&self, bytes: &[u8]) {
        self.state.lock().outbox.extend(bytes);
    }

    /// Sentences the device has decoded from the host
    pub fn received(&self) -> Vec<AsciiSentence> {
        self.state.lock().received.clone()
    }

    /// Current register value
    pub fn register(&self, id: u8) -> Option<Register> {
        self.state.lock().registers.get(&id).cloned()
    }

    /// Overwrite a register value
    pub fn set_register(&self, register: Register) {
        self.state.lock().registers.insert(register.id(), register);
    }

    /// Device-side baud rate, including a switch still waiting on queued output
    pub fn device_baud(&self) -> u32 {
        let state = self.state.lock();
        state.pending_baud.unwrap_or(state.device_baud)
    }

    /// Host-side baud rate
    pub fn host_baud(&self) -> u32 {
        self.state.lock().host_baud
    }

    /// Whether the transport is open
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// `BLD,W` sentences received
    pub fn chunk_writes(&self) -> u32 {
        self.state.lock().chunk_writes
    }

    /// Image written to `processor` by a completed bootloader session
    pub fn flashed_image(&self, processor: &str) -> Option<Vec<u8>> {
        self.state.lock().flashed.get(processor).cloned()
    }

    /// Whether a bootloader session is active
    pub fn in_bootloader(&self) -> bool {
        self.state.lock().bootloader.is_some()
    }
}

/// In-process sensor implementing [`Transport`]
pub struct SimulatedSensor {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedSensor {
    /// Device listening at `device_baud`
    pub fn new(device_baud: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                open: false,
                host_baud: 115_200,
                device_baud,
                pending_baud: None,
                checksum: ChecksumMode::Crc16,
                faults: FaultConfig::default(),
                registers: default_registers(),
                decoder: FrameDecoder::new(),
                outbox: VecDeque::new(),
                received: Vec::new(),
                async_ascii: None,
                async_binary: None,
                async_per_read: 0,
                sample: 0,
                bootloader: None,
                acks: 0,
                chunk_writes: 0,
                flashed: HashMap::new(),
                stats: TransportStats::default(),
            })),
        }
    }

    /// Checksum used for device output
    #[must_use]
    pub fn with_checksum(self, checksum: ChecksumMode) -> Self {
        self.state.lock().checksum = checksum;
        self
    }

    /// Fault settings
    #[must_use]
    pub fn with_faults(self, faults: FaultConfig) -> Self {
        self.state.lock().faults = faults;
        self
    }

    /// Handle for scripting and inspection
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(115_200)
    }
}

#[async_trait]
impl Transport for SimulatedSensor {
    async fn open(&mut self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        state.open = true;
        state.stats = TransportStats::default();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        state.open = false;
        state.outbox.clear();
        state.apply_pending_baud();
        state.decoder.reset();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ConnectionError::NotConnected);
        }
        state.stats.bytes_sent += data.len() as u64;
        state.stats.writes += 1;

        // At the wrong baud rate the device sees line noise.
        if !state.linked() {
            return Ok(data.len());
        }

        let frames = state.decoder.push(data);
        for frame in frames {
            if frame.kind != FrameKind::Ascii {
                continue;
            }
            if let Ok(sentence) = AsciiSentence::parse(&frame.bytes) {
                state.handle(sentence);
            }
        }
        Ok(data.len())
    }

    async fn receive(&mut self) -> Result<Bytes, ConnectionError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ConnectionError::NotConnected);
        }
        if !state.linked() {
            state.outbox.clear();
            state.apply_pending_baud();
            return Ok(Bytes::new());
        }

        let streaming = state.async_per_read;
        state.emit_async(streaming);

        let n = state
            .faults
            .max_read
            .unwrap_or(usize::MAX)
            .min(state.outbox.len());
        let bytes: Vec<u8> = state.outbox.drain(..n).collect();
        state.apply_pending_baud();
        if !bytes.is_empty() {
            state.stats.bytes_received += bytes.len() as u64;
            state.stats.reads += 1;
        }
        Ok(Bytes::from(bytes))
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError> {
        if !is_supported_baud_rate(baud) {
            return Err(ConnectionError::UnsupportedBaudRate(baud));
        }
        let mut state = self.state.lock();
        state.host_baud = baud;
        state.decoder.reset();
        Ok(())
    }

    fn port_name(&self) -> &str {
        SIMULATOR_PORT
    }

    fn baud_rate(&self) -> u32 {
        self.state.lock().host_baud
    }

    fn stats(&self) -> TransportStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::RawFrame;

    fn frames(bytes: &[u8]) -> Vec<RawFrame> {
        FrameDecoder::new().push(bytes)
    }

    #[tokio::test]
    async fn test_answers_register_read() {
        let mut sim = SimulatedSensor::new(115_200);
        sim.open().await.unwrap();
        sim.send(&register::encode_read(1).to_bytes(ChecksumMode::Crc16))
            .await
            .unwrap();
        let out = sim.receive().await.unwrap();
        let frames = frames(&out);
        assert_eq!(frames.len(), 1);
        let sentence = AsciiSentence::parse(&frames[0].bytes).unwrap();
        assert_eq!(sentence.fields, vec!["1", "VN-300-SIM"]);
    }

    #[tokio::test]
    async fn test_wrong_baud_is_silent() {
        let mut sim = SimulatedSensor::new(921_600);
        sim.open().await.unwrap();
        sim.send(&register::encode_read(1).to_bytes(ChecksumMode::Crc16))
            .await
            .unwrap();
        assert!(sim.receive().await.unwrap().is_empty());

        sim.set_baud_rate(921_600).await.unwrap();
        sim.send(&register::encode_read(1).to_bytes(ChecksumMode::Crc16))
            .await
            .unwrap();
        assert_eq!(frames(&sim.receive().await.unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_write_is_refused() {
        let mut sim = SimulatedSensor::default();
        sim.open().await.unwrap();
        let body = AsciiSentence::new("WRG", ["1", "HACKED"]);
        sim.send(&body.to_bytes(ChecksumMode::Crc16)).await.unwrap();
        let out = sim.receive().await.unwrap();
        let sentence = AsciiSentence::parse(&frames(&out)[0].bytes).unwrap();
        assert_eq!(sentence.keyword(), "ERR");
        assert_eq!(sentence.field(0), Some("09"));
    }

    #[tokio::test]
    async fn test_streams_async_output() {
        let mut sim = SimulatedSensor::default();
        let handle = sim.handle();
        sim.open().await.unwrap();
        handle.set_async_ascii(Some("YMR"));
        handle.set_async_per_read(3);
        let out = sim.receive().await.unwrap();
        assert_eq!(frames(&out).len(), 3);
    }
}
