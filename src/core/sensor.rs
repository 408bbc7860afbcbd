//! Sensor connection
//!
//! A [`Sensor`] owns one transport and a background reader task. The reader
//! is the only task that reads from the transport. It feeds raw bytes to the
//! listener hooks, decodes frames, and routes every frame:
//! - command responses go to the dispatcher
//! - async telemetry goes to the listener queue
//! - during a firmware update, every ASCII sentence goes to the bootloader channel
//! - error sentences no command claims go to the listener's error queue

use crate::config::SensorConfig;
use crate::core::command::{is_response, Command, CommandError, CommandRequest, SensorError};
use crate::core::dispatcher::{BusyGuard, CommandDispatcher, CommandSink, DispatchOptions};
use crate::core::firmware::{
    load_images, BootloaderLink, FirmwareUpdateError, FirmwareUpdater, Manifest, ManifestEntry,
    ProcessorPaths, UpdateParams, UpdateReport,
};
use crate::core::listener::{AsyncError, AsyncListener, ByteSink, DataExporter, ListenerStats};
use crate::core::measurement::{Measurement, Quaternion, Ypr};
use crate::core::protocol::{AsciiSentence, DecoderStats, FrameDecoder, FrameKind, RawFrame};
use crate::core::register::{decode_response, BaudRate, CodecError, BaudRateRegister, Register, SerialPortSelect};
use crate::core::transport::{
    ConnectionError, SerialConfig, SerialTransport, Transport, TransportStats,
};
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MODEL_REGISTER_ID: u8 = 1;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport
    #[default]
    Disconnected,
    /// Transport open, reader running
    Connected,
    /// The reader stopped after a transport failure
    Error,
}

/// Counters across the connection layers
#[derive(Debug, Clone, Default)]
pub struct SensorStats {
    /// Transport counters, `None` when disconnected
    pub transport: Option<TransportStats>,
    /// Frame decoder counters
    pub decoder: DecoderStats,
    /// Listener counters
    pub listener: ListenerStats,
}

struct Shared {
    config: SensorConfig,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    dispatcher: CommandDispatcher,
    listener: AsyncListener,
    bootloader: Mutex<Option<mpsc::UnboundedSender<AsciiSentence>>>,
    state: Mutex<ConnectionState>,
    decoder_stats: Mutex<DecoderStats>,
    baud: AtomicU32,
}

impl Shared {
    async fn send_raw(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        transport.send(bytes).await?;
        Ok(())
    }

    async fn set_host_baud_rate(&self, baud: u32) -> Result<(), ConnectionError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        transport.set_baud_rate(baud).await?;
        self.baud.store(baud, Ordering::SeqCst);
        debug!(baud, "host baud rate changed");
        Ok(())
    }

    /// Take and close the transport; later calls are no-ops
    async fn release_transport(&self) {
        let transport = self.transport.lock().await.take();
        if let Some(mut transport) = transport {
            if let Err(e) = transport.close().await {
                warn!(port = transport.port_name(), error = %e, "error closing transport");
            }
        }
    }

    fn route(&self, frame: RawFrame) {
        self.listener.on_frame(&frame);
        let bootloader = self.bootloader.lock().clone();

        match frame.kind {
            FrameKind::Binary => {
                if bootloader.is_none() {
                    self.listener.handle_binary(&frame);
                }
            }
            FrameKind::Ascii => {
                let Ok(sentence) = AsciiSentence::parse(&frame.bytes) else {
                    return;
                };
                if let Some(tx) = bootloader {
                    let _ = tx.send(sentence);
                } else if is_response(&sentence) {
                    if let Some(unmatched) = self.dispatcher.offer(sentence) {
                        match SensorError::from_sentence(&unmatched) {
                            Some(error) => self.listener.push_async_error(error),
                            None => warn!(header = %unmatched.header, "dropping unexpected response"),
                        }
                    }
                } else {
                    self.listener.handle_ascii(&sentence);
                }
            }
        }
    }
}

#[async_trait]
impl CommandSink for Shared {
    async fn send_frame(&self, bytes: &[u8]) -> Result<(), CommandError> {
        Ok(self.send_raw(bytes).await?)
    }
}

async fn run_reader(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut decoder = FrameDecoder::new();
    decoder.capture_skipped(true);
    let poll = shared.config.poll_interval();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let received = {
            let mut guard = shared.transport.lock().await;
            match guard.as_mut() {
                Some(transport) => transport.receive().await,
                None => break,
            }
        };

        match received {
            Ok(bytes) if bytes.is_empty() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            Ok(bytes) => {
                shared.listener.on_bytes(&bytes);
                for frame in decoder.push(&bytes) {
                    shared.route(frame);
                }
                let skipped = decoder.take_skipped();
                if !skipped.is_empty() {
                    shared.listener.on_skipped_bytes(&skipped);
                }
                *shared.decoder_stats.lock() = decoder.stats();
                tokio::task::yield_now().await;
            }
            Err(e) => {
                warn!(error = %e, "transport read failed, closing connection");
                *shared.state.lock() = ConnectionState::Error;
                shared.dispatcher.cancel_pending();
                break;
            }
        }
    }

    shared.release_transport().await;
    debug!("reader stopped");
}

struct ReaderTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle to one sensor
///
/// ```no_run
/// # async fn demo() -> Result<(), vnlink_core::Error> {
/// use vnlink_core::{Register, Sensor, SensorConfig};
///
/// let mut sensor = Sensor::new(SensorConfig::default());
/// sensor.auto_connect("/dev/ttyUSB0").await?;
///
/// let mut model = Register::from_id(1).expect("model register");
/// sensor.read_register(&mut model).await?;
/// println!("{model:?}");
///
/// sensor.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct Sensor {
    shared: Arc<Shared>,
    reader: Option<ReaderTask>,
}

impl Sensor {
    /// Disconnected sensor using `config`
    pub fn new(config: SensorConfig) -> Self {
        let dispatcher = CommandDispatcher::new(config.dispatch_options());
        let listener = AsyncListener::new(config.listener.queue_capacity)
            .with_error_capacity(config.listener.error_queue_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                transport: tokio::sync::Mutex::new(None),
                dispatcher,
                listener,
                bootloader: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                decoder_stats: Mutex::new(DecoderStats::default()),
                baud: AtomicU32::new(0),
            }),
            reader: None,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &SensorConfig {
        &self.shared.config
    }

    /// Connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Whether the transport is open and the reader is running
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Host-side baud rate, 0 when never connected
    pub fn baud_rate(&self) -> u32 {
        self.shared.baud.load(Ordering::SeqCst)
    }

    // Connection

    /// Open a serial port at `baud`
    pub async fn connect(&mut self, port: &str, baud: u32) -> Result<(), ConnectionError> {
        let transport = SerialTransport::new(SerialConfig::new(port, baud))?;
        self.connect_with_transport(Box::new(transport)).await
    }

    /// Open `transport` and start the reader
    pub async fn connect_with_transport(
        &mut self,
        mut transport: Box<dyn Transport>,
    ) -> Result<(), ConnectionError> {
        self.disconnect().await;
        transport.open().await?;

        let port = transport.port_name().to_string();
        let baud = transport.baud_rate();
        self.shared.baud.store(baud, Ordering::SeqCst);
        *self.shared.transport.lock().await = Some(transport);
        *self.shared.decoder_stats.lock() = DecoderStats::default();
        self.start_reader();
        *self.shared.state.lock() = ConnectionState::Connected;
        info!(%port, baud, "connected");
        Ok(())
    }

    /// Open a serial port and find the sensor's baud rate
    ///
    /// Returns the rate that answered.
    pub async fn auto_connect(&mut self, port: &str) -> Result<u32, ConnectionError> {
        let first = self
            .shared
            .config
            .connection
            .auto_connect_baud_rates
            .first()
            .copied()
            .ok_or_else(|| ConnectionError::ConnectionFailed("no candidate baud rates".into()))?;
        let transport = SerialTransport::new(SerialConfig::new(port, first))?;
        self.auto_connect_with_transport(Box::new(transport)).await
    }

    /// Open `transport` and try each configured baud rate with a Model read
    pub async fn auto_connect_with_transport(
        &mut self,
        transport: Box<dyn Transport>,
    ) -> Result<u32, ConnectionError> {
        let port = transport.port_name().to_string();
        self.connect_with_transport(transport).await?;

        let candidates = self.shared.config.connection.auto_connect_baud_rates.clone();
        let per_rate = self.shared.config.baud_search_options();
        for baud in candidates {
            if let Err(e) = self.shared.set_host_baud_rate(baud).await {
                debug!(baud, error = %e, "skipping baud rate");
                continue;
            }
            match self.verify_connectivity_with(per_rate).await {
                Ok(()) => {
                    info!(%port, baud, "sensor found");
                    return Ok(baud);
                }
                Err(e) => debug!(baud, error = %e, "no answer at baud rate"),
            }
        }

        warn!(%port, "no sensor answered at any baud rate");
        self.disconnect().await;
        Err(ConnectionError::NoResponse(port))
    }

    /// Check the sensor answers a Model register read
    pub async fn verify_connectivity(&self) -> Result<(), CommandError> {
        self.verify_connectivity_with(self.shared.dispatcher.options())
            .await
    }

    async fn verify_connectivity_with(&self, options: DispatchOptions) -> Result<(), CommandError> {
        let id = MODEL_REGISTER_ID;
        self.shared
            .dispatcher
            .execute_decoded(
                self.shared.as_ref(),
                CommandRequest::ReadRegister { id },
                options,
                |response| decode_response(id, response).map(drop),
            )
            .await
    }

    /// Stop the reader, clear queued measurements and close the transport
    ///
    /// Calling it again is a no-op.
    pub async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.cancel.cancel();
            if let Err(e) = reader.handle.await {
                warn!(error = %e, "reader task ended abnormally");
            }
        }
        self.shared.listener.clear();
        self.shared.dispatcher.cancel_pending();
        self.shared.release_transport().await;

        let mut state = self.shared.state.lock();
        if *state != ConnectionState::Disconnected {
            info!("disconnected");
        }
        *state = ConnectionState::Disconnected;
    }

    fn start_reader(&mut self) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_reader(Arc::clone(&self.shared), cancel.clone()));
        self.reader = Some(ReaderTask { cancel, handle });
    }

    // Commands

    /// Send a command and wait for its response
    pub async fn execute(&self, request: CommandRequest) -> Result<AsciiSentence, CommandError> {
        self.shared
            .dispatcher
            .execute(self.shared.as_ref(), request)
            .await
    }

    /// Send `request` and decode its response before the command completes
    async fn execute_decoded<T, F>(&self, request: CommandRequest, decode: F) -> Result<T, CommandError>
    where
        F: FnOnce(&AsciiSentence) -> Result<T, CodecError> + Send,
    {
        self.shared
            .dispatcher
            .execute_decoded(
                self.shared.as_ref(),
                request,
                self.shared.dispatcher.options(),
                decode,
            )
            .await
    }

    /// The most recently finished command
    pub fn last_command(&self) -> Option<Command> {
        self.shared.dispatcher.last_command()
    }

    /// Write raw bytes to the transport, bypassing the dispatcher
    pub async fn serial_send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.shared.send_raw(bytes).await
    }

    /// Read the register identified by `register` and overwrite it with the
    /// sensor's value
    pub async fn read_register(&self, register: &mut Register) -> Result<(), CommandError> {
        let id = register.id();
        *register = self
            .execute_decoded(CommandRequest::ReadRegister { id }, |response| {
                decode_response(id, response)
            })
            .await?;
        Ok(())
    }

    /// Write `register` to the sensor
    ///
    /// Writing a binary output register also activates its layout for
    /// incoming binary packets.
    pub async fn write_register(&self, register: &Register) -> Result<(), CommandError> {
        let id = register.id();
        self.execute_decoded(CommandRequest::WriteRegister(register.clone()), |response| {
            decode_response(id, response).map(drop)
        })
        .await?;

        if let Some(group) = register.binary_output() {
            if group.async_mode.is_empty() {
                self.shared.listener.remove_binary_output(register.id());
            } else {
                self.shared
                    .listener
                    .register_binary_output(register.id(), *group);
            }
        }
        Ok(())
    }

    /// Change the sensor's baud rate, then follow it on the host side
    pub async fn change_baud_rate(&self, baud: BaudRate) -> Result<(), CommandError> {
        let register = Register::BaudRate(BaudRateRegister {
            baud_rate: baud,
            serial_port: SerialPortSelect::Active,
        });
        self.write_register(&register).await?;
        self.change_host_baud_rate(baud.value()).await?;
        info!(baud = baud.value(), "baud rate changed");
        Ok(())
    }

    /// Change only the host-side baud rate
    pub async fn change_host_baud_rate(&self, baud: u32) -> Result<(), ConnectionError> {
        self.shared.set_host_baud_rate(baud).await
    }

    /// Save the current configuration to non-volatile memory
    pub async fn write_settings(&self) -> Result<(), CommandError> {
        self.execute(CommandRequest::WriteSettings).await.map(drop)
    }

    /// Restore factory settings
    pub async fn restore_factory_settings(&self) -> Result<(), CommandError> {
        self.execute(CommandRequest::RestoreFactorySettings)
            .await
            .map(drop)
    }

    /// Reset the sensor
    pub async fn reset(&self) -> Result<(), CommandError> {
        self.execute(CommandRequest::Reset).await.map(drop)
    }

    /// Pause or resume async output
    pub async fn set_async_output_enabled(&self, enabled: bool) -> Result<(), CommandError> {
        self.execute(CommandRequest::AsyncOutputEnable(enabled))
            .await
            .map(drop)
    }

    /// Report a known magnetic disturbance
    pub async fn known_magnetic_disturbance(&self, present: bool) -> Result<(), CommandError> {
        self.execute(CommandRequest::KnownMagneticDisturbance(present))
            .await
            .map(drop)
    }

    /// Report a known acceleration disturbance
    pub async fn known_acceleration_disturbance(&self, present: bool) -> Result<(), CommandError> {
        self.execute(CommandRequest::KnownAccelerationDisturbance(present))
            .await
            .map(drop)
    }

    /// Seed the heading estimate, degrees
    pub async fn set_initial_heading(&self, heading: f32) -> Result<(), CommandError> {
        self.execute(CommandRequest::SetInitialHeading(heading))
            .await
            .map(drop)
    }

    /// Seed the full attitude estimate from yaw, pitch and roll in degrees
    pub async fn set_initial_heading_ypr(&self, ypr: Ypr) -> Result<(), CommandError> {
        self.execute(CommandRequest::SetInitialHeadingYpr(ypr))
            .await
            .map(drop)
    }

    /// Seed the full attitude estimate from a quaternion
    pub async fn set_initial_heading_quaternion(&self, q: Quaternion) -> Result<(), CommandError> {
        self.execute(CommandRequest::SetInitialHeadingQuaternion(q))
            .await
            .map(drop)
    }

    /// Load the current sensor biases into the filter
    pub async fn set_filter_bias(&self) -> Result<(), CommandError> {
        self.execute(CommandRequest::SetFilterBias).await.map(drop)
    }

    // Measurements

    /// Oldest queued measurement, waiting up to `timeout`
    pub async fn next_measurement(&self, timeout: Duration) -> Option<Measurement> {
        self.shared.listener.next_measurement(timeout).await
    }

    /// Whether a measurement is queued
    pub fn has_measurement(&self) -> bool {
        self.shared.listener.has_measurement()
    }

    /// Newest queued measurement, left in the queue
    pub fn most_recent_measurement(&self) -> Option<Measurement> {
        self.shared.listener.most_recent_measurement()
    }

    /// Stream of measurements in arrival order
    pub fn measurements(&self) -> impl Stream<Item = Measurement> + '_ {
        self.shared.listener.measurements()
    }

    /// Drop every queued measurement
    pub fn clear_measurements(&self) {
        self.shared.listener.clear();
    }

    /// Receive every raw byte span read from the transport
    pub fn register_received_byte_buffer(&self, sink: Arc<dyn ByteSink>) {
        self.shared.listener.register_received_byte_buffer(sink);
    }

    /// Remove a byte sink
    pub fn deregister_received_byte_buffer(&self, sink: &Arc<dyn ByteSink>) {
        self.shared.listener.deregister_received_byte_buffer(sink);
    }

    /// Receive every byte the decoder discards while searching for a frame
    pub fn register_skipped_byte_buffer(&self, sink: Arc<dyn ByteSink>) {
        self.shared.listener.register_skipped_byte_buffer(sink);
    }

    /// Remove a skipped-byte sink
    pub fn deregister_skipped_byte_buffer(&self, sink: &Arc<dyn ByteSink>) {
        self.shared.listener.deregister_skipped_byte_buffer(sink);
    }

    /// Oldest error the sensor raised outside a command, waiting up to `timeout`
    pub async fn next_async_error(&self, timeout: Duration) -> Option<AsyncError> {
        self.shared.listener.next_async_error(timeout).await
    }

    /// Whether an unsolicited sensor error is queued
    pub fn has_async_error(&self) -> bool {
        self.shared.listener.has_async_error()
    }

    /// Receive every validated frame and measurement
    pub fn register_data_exporter(&self, exporter: Arc<dyn DataExporter>) {
        self.shared.listener.register_data_exporter(exporter);
    }

    /// Remove a data exporter
    pub fn deregister_data_exporter(&self, exporter: &Arc<dyn DataExporter>) {
        self.shared.listener.deregister_data_exporter(exporter);
    }

    /// The measurement listener
    pub fn listener(&self) -> &AsyncListener {
        &self.shared.listener
    }

    /// Counters
    pub async fn stats(&self) -> SensorStats {
        let transport = self.shared.transport.lock().await.as_ref().map(|t| t.stats());
        SensorStats {
            transport,
            decoder: *self.shared.decoder_stats.lock(),
            listener: self.shared.listener.stats(),
        }
    }

    // Firmware

    /// Hold the connection for a bootloader session
    ///
    /// Commands fail with `Busy` and every ASCII sentence is diverted to the
    /// returned link until it is dropped.
    pub async fn enter_firmware_mode(&self) -> Result<FirmwareLink<'_>, FirmwareUpdateError> {
        if self.shared.dispatcher.is_busy() {
            return Err(FirmwareUpdateError::Busy);
        }
        if self.shared.transport.lock().await.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }

        let guard = self.shared.dispatcher.acquire_exclusive().await;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.bootloader.lock() = Some(tx);
        info!("entered firmware mode");
        Ok(FirmwareLink {
            shared: &self.shared,
            rx,
            _guard: guard,
        })
    }

    /// Update every processor listed in a manifest
    pub async fn update_from_manifest(
        &self,
        path: impl AsRef<Path>,
        params: UpdateParams,
    ) -> Result<UpdateReport, FirmwareUpdateError> {
        let manifest = Manifest::load(path).await?;
        self.update_entries(&manifest.images, params).await
    }

    /// Update the processors that have an image path
    pub async fn update_processors(
        &self,
        paths: &ProcessorPaths,
        params: UpdateParams,
    ) -> Result<UpdateReport, FirmwareUpdateError> {
        self.update_entries(&paths.entries(), params).await
    }

    async fn update_entries(
        &self,
        entries: &[ManifestEntry],
        params: UpdateParams,
    ) -> Result<UpdateReport, FirmwareUpdateError> {
        if entries.is_empty() {
            return Err(FirmwareUpdateError::Image("no processor paths supplied".into()));
        }
        let settings = self.shared.config.firmware.clone();
        let images = load_images(entries, settings.chunk_size).await?;

        let mut link = self.enter_firmware_mode().await?;
        let report = FirmwareUpdater::new(&mut link, settings, params)
            .run(&images)
            .await;
        drop(link);
        Ok(report)
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.cancel.cancel();
        }
    }
}

/// Exclusive bootloader channel returned by [`Sensor::enter_firmware_mode`]
pub struct FirmwareLink<'a> {
    shared: &'a Arc<Shared>,
    rx: mpsc::UnboundedReceiver<AsciiSentence>,
    _guard: BusyGuard,
}

#[async_trait]
impl<'a> BootloaderLink for FirmwareLink<'a> {
    async fn send_sentence(&mut self, sentence: &AsciiSentence) -> Result<(), FirmwareUpdateError> {
        let bytes = sentence.to_bytes(self.shared.config.protocol.checksum);
        Ok(self.shared.send_raw(&bytes).await?)
    }

    async fn recv_sentence(&mut self, timeout: Duration) -> Option<AsciiSentence> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn set_host_baud_rate(&mut self, baud: u32) -> Result<(), FirmwareUpdateError> {
        Ok(self.shared.set_host_baud_rate(baud).await?)
    }
}

impl Drop for FirmwareLink<'_> {
    fn drop(&mut self) {
        self.shared.bootloader.lock().take();
        info!("left firmware mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulator::SimulatedSensor;

    #[tokio::test]
    async fn test_commands_fail_when_disconnected() {
        let sensor = Sensor::new(SensorConfig::default());
        let mut reg = Register::from_id(1).unwrap();
        let result = sensor.read_register(&mut reg).await;
        assert!(matches!(
            result,
            Err(CommandError::Transport(ConnectionError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut sensor = Sensor::new(SensorConfig::default());
        let sim = SimulatedSensor::new(115_200);
        let handle = sim.handle();
        sensor.connect_with_transport(Box::new(sim)).await.unwrap();
        assert!(sensor.is_connected());
        assert!(handle.is_open());

        sensor.disconnect().await;
        sensor.disconnect().await;
        assert_eq!(sensor.state(), ConnectionState::Disconnected);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_firmware_mode_blocks_commands() {
        let mut sensor = Sensor::new(SensorConfig::default());
        sensor
            .connect_with_transport(Box::new(SimulatedSensor::new(115_200)))
            .await
            .unwrap();

        let link = sensor.enter_firmware_mode().await.unwrap();
        assert!(matches!(sensor.reset().await, Err(CommandError::Busy)));
        assert!(matches!(
            sensor.enter_firmware_mode().await,
            Err(FirmwareUpdateError::Busy)
        ));
        drop(link);

        sensor.reset().await.unwrap();
        sensor.disconnect().await;
    }
}
