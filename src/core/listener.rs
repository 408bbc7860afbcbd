//! Asynchronous measurement listener
//!
//! Telemetry lands in a bounded FIFO. When the queue is full the oldest entry
//! is discarded so the reader task never waits on a slow consumer. Errors the
//! sensor reports outside any command get a second, smaller FIFO with the
//! same policy. Byte sinks and data exporters are called synchronously from
//! the reader task.

use crate::core::command::SensorError;
use crate::core::measurement::{decode_ascii, decode_binary, Measurement};
use crate::core::protocol::{AsciiSentence, RawFrame};
use crate::core::register::BinaryOutputGroup;
use futures::stream::{self, Stream};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default capacity of the async error queue
pub const DEFAULT_ERROR_QUEUE_CAPACITY: usize = 32;

/// An error the sensor reported without a command to attribute it to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncError {
    /// Reported error
    pub error: SensorError,
    /// Host time the report was decoded
    pub received_at: DateTime<Utc>,
}

/// Receives every byte span read from the transport
pub trait ByteSink: Send + Sync {
    /// Bytes as read, before framing
    fn on_bytes(&self, bytes: &[u8]);
}

/// Receives validated frames and decoded measurements
pub trait DataExporter: Send + Sync {
    /// A frame that passed its integrity check
    fn export_frame(&self, frame: &RawFrame);

    /// A measurement about to be queued
    fn export_measurement(&self, _measurement: &Measurement) {}
}

/// Bounded ring of received bytes
///
/// Keeps the newest `capacity` bytes; older bytes are overwritten and counted.
pub struct ReceivedByteBuffer {
    bytes: Mutex<VecDeque<u8>>,
    capacity: usize,
    overwritten: AtomicU64,
}

impl ReceivedByteBuffer {
    /// Ring holding up to `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overwritten: AtomicU64::new(0),
        }
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// Bytes lost to overwriting
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    /// Remove and return up to `max` of the oldest bytes
    pub fn drain(&self, max: usize) -> Vec<u8> {
        let mut bytes = self.bytes.lock();
        let n = max.min(bytes.len());
        bytes.drain(..n).collect()
    }

    /// Remove and return everything
    pub fn take_all(&self) -> Vec<u8> {
        self.bytes.lock().drain(..).collect()
    }
}

impl ByteSink for ReceivedByteBuffer {
    fn on_bytes(&self, data: &[u8]) {
        if self.capacity == 0 {
            self.overwritten.fetch_add(data.len() as u64, Ordering::Relaxed);
            return;
        }
        let mut bytes = self.bytes.lock();
        let data = if data.len() > self.capacity {
            let excess = data.len() - self.capacity;
            self.overwritten.fetch_add(excess as u64, Ordering::Relaxed);
            &data[excess..]
        } else {
            data
        };
        let overflow = (bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            bytes.drain(..overflow);
            self.overwritten.fetch_add(overflow as u64, Ordering::Relaxed);
        }
        bytes.extend(data);
    }
}

/// Listener counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Measurements queued
    pub queued: u64,
    /// Measurements discarded because the queue was full
    pub dropped: u64,
    /// Binary packets whose header matched no registered output
    pub unmatched_binary: u64,
    /// Packets that framed correctly but failed to decode
    pub decode_errors: u64,
    /// Unsolicited sensor errors received
    pub async_errors: u64,
    /// Unsolicited sensor errors discarded because their queue was full
    pub dropped_errors: u64,
}

/// Bounded measurement queue with hooks
pub struct AsyncListener {
    queue: Mutex<VecDeque<Measurement>>,
    capacity: usize,
    notify: Notify,
    most_recent: Mutex<Option<Measurement>>,
    errors: Mutex<VecDeque<AsyncError>>,
    error_capacity: usize,
    error_notify: Notify,
    outputs: RwLock<Vec<(u8, BinaryOutputGroup)>>,
    byte_sinks: RwLock<Vec<Arc<dyn ByteSink>>>,
    skipped_sinks: RwLock<Vec<Arc<dyn ByteSink>>>,
    exporters: RwLock<Vec<Arc<dyn DataExporter>>>,
    queued: AtomicU64,
    dropped: AtomicU64,
    unmatched_binary: AtomicU64,
    decode_errors: AtomicU64,
    async_errors: AtomicU64,
    dropped_errors: AtomicU64,
}

impl AsyncListener {
    /// Listener with a queue of `capacity` measurements (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY))),
            capacity,
            notify: Notify::new(),
            most_recent: Mutex::new(None),
            errors: Mutex::new(VecDeque::new()),
            error_capacity: DEFAULT_ERROR_QUEUE_CAPACITY,
            error_notify: Notify::new(),
            outputs: RwLock::new(Vec::new()),
            byte_sinks: RwLock::new(Vec::new()),
            skipped_sinks: RwLock::new(Vec::new()),
            exporters: RwLock::new(Vec::new()),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unmatched_binary: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            async_errors: AtomicU64::new(0),
            dropped_errors: AtomicU64::new(0),
        }
    }

    /// Keep up to `capacity` unsolicited errors (at least one)
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity.max(1);
        self
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counters
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unmatched_binary: self.unmatched_binary.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            async_errors: self.async_errors.load(Ordering::Relaxed),
            dropped_errors: self.dropped_errors.load(Ordering::Relaxed),
        }
    }

    // Binary output layouts

    /// Decode binary packets whose header matches `group` as output `id`
    ///
    /// Replaces any layout previously registered for `id`.
    pub fn register_binary_output(&self, id: u8, group: BinaryOutputGroup) {
        let mut outputs = self.outputs.write();
        outputs.retain(|(existing, _)| *existing != id);
        if !group.header.is_empty() {
            outputs.push((id, group));
        }
    }

    /// Stop decoding packets for output `id`
    pub fn remove_binary_output(&self, id: u8) {
        self.outputs.write().retain(|(existing, _)| *existing != id);
    }

    /// Registered layouts
    pub fn binary_outputs(&self) -> Vec<(u8, BinaryOutputGroup)> {
        self.outputs.read().clone()
    }

    // Hooks

    /// Register a raw byte sink
    pub fn register_received_byte_buffer(&self, sink: Arc<dyn ByteSink>) {
        self.byte_sinks.write().push(sink);
    }

    /// Remove a raw byte sink
    pub fn deregister_received_byte_buffer(&self, sink: &Arc<dyn ByteSink>) {
        self.byte_sinks.write().retain(|s| !Arc::ptr_eq(s, sink));
    }

    /// Register a sink for bytes the frame decoder discarded
    pub fn register_skipped_byte_buffer(&self, sink: Arc<dyn ByteSink>) {
        self.skipped_sinks.write().push(sink);
    }

    /// Remove a skipped-byte sink
    pub fn deregister_skipped_byte_buffer(&self, sink: &Arc<dyn ByteSink>) {
        self.skipped_sinks.write().retain(|s| !Arc::ptr_eq(s, sink));
    }

    /// Register a frame and measurement exporter
    pub fn register_data_exporter(&self, exporter: Arc<dyn DataExporter>) {
        self.exporters.write().push(exporter);
    }

    /// Remove an exporter
    pub fn deregister_data_exporter(&self, exporter: &Arc<dyn DataExporter>) {
        self.exporters.write().retain(|e| !Arc::ptr_eq(e, exporter));
    }

    // Reader-side entry points

    pub(crate) fn on_bytes(&self, bytes: &[u8]) {
        for sink in self.byte_sinks.read().iter() {
            sink.on_bytes(bytes);
        }
    }

    pub(crate) fn on_skipped_bytes(&self, bytes: &[u8]) {
        for sink in self.skipped_sinks.read().iter() {
            sink.on_bytes(bytes);
        }
    }

    pub(crate) fn on_frame(&self, frame: &RawFrame) {
        for exporter in self.exporters.read().iter() {
            exporter.export_frame(frame);
        }
    }

    /// Decode an async ASCII sentence and queue it
    pub(crate) fn handle_ascii(&self, sentence: &AsciiSentence) {
        match decode_ascii(sentence) {
            Ok(measurement) => self.push(measurement),
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(header = %sentence.header, error = %e, "undecodable async sentence");
            }
        }
    }

    /// Decode a binary packet against the registered outputs and queue it
    pub(crate) fn handle_binary(&self, frame: &RawFrame) {
        let (Some(header), Some(payload)) = (frame.header, frame.binary_payload()) else {
            return;
        };
        let output = self
            .outputs
            .read()
            .iter()
            .find(|(_, group)| group.matches(&header))
            .map(|(id, _)| *id);

        let Some(output) = output else {
            self.unmatched_binary.fetch_add(1, Ordering::Relaxed);
            trace!(groups = header.group_byte(), "binary packet matches no registered output");
            return;
        };

        match decode_binary(&header, output, payload) {
            Ok(measurement) => self.push(measurement),
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(output, error = %e, "undecodable binary packet");
            }
        }
    }

    /// Queue a measurement, discarding the oldest when full
    pub fn push(&self, measurement: Measurement) {
        for exporter in self.exporters.read().iter() {
            exporter.export_measurement(&measurement);
        }
        *self.most_recent.lock() = Some(measurement.clone());

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(measurement);
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    // Consumer side

    /// Oldest queued measurement, without waiting
    pub fn try_next(&self) -> Option<Measurement> {
        self.queue.lock().pop_front()
    }

    /// Oldest queued measurement, waiting up to `timeout` for one to arrive
    ///
    /// A zero timeout never waits.
    pub async fn next_measurement(&self, timeout: Duration) -> Option<Measurement> {
        if let Some(measurement) = self.try_next() {
            return Some(measurement);
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(measurement) = self.try_next() {
                return Some(measurement);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_next();
            }
        }
    }

    async fn wait_next(&self) -> Measurement {
        loop {
            let notified = self.notify.notified();
            if let Some(measurement) = self.try_next() {
                return measurement;
            }
            notified.await;
        }
    }

    /// Endless stream of queued measurements
    pub fn measurements(&self) -> impl Stream<Item = Measurement> + '_ {
        stream::unfold(self, |listener| async move {
            let measurement = listener.wait_next().await;
            Some((measurement, listener))
        })
    }

    /// Whether a measurement is queued
    pub fn has_measurement(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Number of queued measurements
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Latest measurement produced, whether or not it was consumed
    pub fn most_recent_measurement(&self) -> Option<Measurement> {
        self.most_recent.lock().clone()
    }

    /// Discard queued measurements
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    // Async errors

    /// Queue an unsolicited sensor error, discarding the oldest when full
    pub fn push_async_error(&self, error: SensorError) {
        warn!(%error, "sensor reported an error");
        {
            let mut errors = self.errors.lock();
            if errors.len() >= self.error_capacity {
                errors.pop_front();
                self.dropped_errors.fetch_add(1, Ordering::Relaxed);
            }
            errors.push_back(AsyncError {
                error,
                received_at: Utc::now(),
            });
        }
        self.async_errors.fetch_add(1, Ordering::Relaxed);
        self.error_notify.notify_one();
    }

    /// Oldest unsolicited error, without waiting
    pub fn try_next_async_error(&self) -> Option<AsyncError> {
        self.errors.lock().pop_front()
    }

    /// Oldest unsolicited error, waiting up to `timeout` for one to arrive
    pub async fn next_async_error(&self, timeout: Duration) -> Option<AsyncError> {
        if let Some(error) = self.try_next_async_error() {
            return Some(error);
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.error_notify.notified();
            if let Some(error) = self.try_next_async_error() {
                return Some(error);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_next_async_error();
            }
        }
    }

    /// Whether an unsolicited error is queued
    pub fn has_async_error(&self) -> bool {
        !self.errors.lock().is_empty()
    }
}

impl Default for AsyncListener {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
