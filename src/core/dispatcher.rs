//! Command dispatcher
//!
//! Serialises commands on one connection: at most one is pending, callers
//! queue on an async mutex, and the reader task hands every response-shaped
//! sentence to [`CommandDispatcher::offer`] which resolves the pending command
//! when the sentence matches it.

use crate::core::command::{Command, CommandError, CommandRequest, CommandState, SensorError};
use crate::core::protocol::{AsciiSentence, ChecksumMode};
use crate::core::register::CodecError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Where the dispatcher writes framed commands
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Write one framed command
    async fn send_frame(&self, bytes: &[u8]) -> Result<(), CommandError>;
}

/// Timing and encoding of commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchOptions {
    /// Wait per attempt
    pub timeout: Duration,
    /// Sends before giving up, at least one
    pub attempts: u32,
    /// Checksum appended to outgoing sentences
    pub checksum: ChecksumMode,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            attempts: 3,
            checksum: ChecksumMode::Crc16,
        }
    }
}

type Reply = Result<AsciiSentence, CommandError>;

struct Pending {
    token: Uuid,
    request: CommandRequest,
    tx: oneshot::Sender<Reply>,
}

/// Exclusive hold on the command slot; commands fail with `Busy` until dropped
pub struct BusyGuard {
    _slot: OwnedMutexGuard<()>,
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Single-slot command dispatcher
pub struct CommandDispatcher {
    options: DispatchOptions,
    slot: Arc<tokio::sync::Mutex<()>>,
    pending: Mutex<Option<Pending>>,
    busy: Arc<AtomicBool>,
    last: Mutex<Option<Command>>,
}

impl CommandDispatcher {
    /// Dispatcher using `options` for every command
    pub fn new(options: DispatchOptions) -> Self {
        Self {
            options,
            slot: Arc::new(tokio::sync::Mutex::new(())),
            pending: Mutex::new(None),
            busy: Arc::new(AtomicBool::new(false)),
            last: Mutex::new(None),
        }
    }

    /// Options used by [`execute`](Self::execute)
    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    /// Whether commands are refused
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Whether a command is waiting for its response
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Record of the most recently finished command
    pub fn last_command(&self) -> Option<Command> {
        self.last.lock().clone()
    }

    /// Wait for the in-flight command to finish, then refuse commands until
    /// the guard is dropped
    pub async fn acquire_exclusive(&self) -> BusyGuard {
        let slot = Arc::clone(&self.slot).lock_owned().await;
        self.busy.store(true, Ordering::SeqCst);
        BusyGuard {
            _slot: slot,
            busy: Arc::clone(&self.busy),
        }
    }

    /// Send `request` and wait for its response with the default options
    pub async fn execute(
        &self,
        sink: &dyn CommandSink,
        request: CommandRequest,
    ) -> Result<AsciiSentence, CommandError> {
        self.execute_with(sink, request, self.options).await
    }

    /// Send `request` and wait for its response
    ///
    /// Each attempt waits `options.timeout`; after `options.attempts` sends
    /// without a matching response the command times out.
    pub async fn execute_with(
        &self,
        sink: &dyn CommandSink,
        request: CommandRequest,
        options: DispatchOptions,
    ) -> Result<AsciiSentence, CommandError> {
        self.execute_decoded(sink, request, options, |response| Ok(response.clone()))
            .await
    }

    /// Send `request` and decode its response with `decode`
    ///
    /// A response that matches but does not decode fails the command, and the
    /// command record ends `Failed`.
    pub async fn execute_decoded<T, F>(
        &self,
        sink: &dyn CommandSink,
        request: CommandRequest,
        options: DispatchOptions,
        decode: F,
    ) -> Result<T, CommandError>
    where
        F: FnOnce(&AsciiSentence) -> Result<T, CodecError> + Send,
    {
        if self.is_busy() {
            return Err(CommandError::Busy);
        }
        let _slot = self.slot.lock().await;
        if self.is_busy() {
            return Err(CommandError::Busy);
        }

        let mut command = Command::new(request);
        let bytes = command.encode(options.checksum)?;
        let attempts = options.attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                command.retries += 1;
                debug!(
                    keyword = command.request.keyword(),
                    attempt = attempt + 1,
                    attempts,
                    "resending command"
                );
            }

            let (tx, rx) = oneshot::channel();
            *self.pending.lock() = Some(Pending {
                token: command.token,
                request: command.request.clone(),
                tx,
            });

            if let Err(e) = sink.send_frame(&bytes).await {
                self.pending.lock().take();
                return Err(self.finish(command, CommandState::Failed, e));
            }

            match tokio::time::timeout(options.timeout, rx).await {
                Ok(Ok(Ok(response))) => {
                    return match decode(&response) {
                        Ok(value) => {
                            command.state = CommandState::Fulfilled;
                            *self.last.lock() = Some(command);
                            Ok(value)
                        }
                        Err(e) => {
                            warn!(keyword = command.request.keyword(), error = %e, "malformed response");
                            Err(self.finish(command, CommandState::Failed, e.into()))
                        }
                    };
                }
                Ok(Ok(Err(e))) => return Err(self.finish(command, CommandState::Failed, e)),
                Ok(Err(_)) => {
                    return Err(self.finish(command, CommandState::Failed, CommandError::Disconnected))
                }
                Err(_) => {}
            }
        }

        self.take_pending(command.token);
        debug!(keyword = command.request.keyword(), attempts, "command timed out");
        Err(self.finish(command, CommandState::TimedOut, CommandError::Timeout { attempts }))
    }

    /// Offer a response-shaped sentence to the pending command
    ///
    /// Returns the sentence back when nothing was waiting for it. Errors the
    /// sensor raises on its own (hard fault, watchdog reset, buffer
    /// overflows) are never attributed to the pending command.
    pub fn offer(&self, sentence: AsciiSentence) -> Option<AsciiSentence> {
        let mut pending = self.pending.lock();
        let Some(current) = pending.as_ref() else {
            return Some(sentence);
        };

        let reply = match SensorError::from_sentence(&sentence) {
            Some(error) if error.is_asynchronous() => return Some(sentence),
            Some(error) => {
                warn!(keyword = current.request.keyword(), %error, "sensor rejected command");
                Err(CommandError::Sensor(error))
            }
            None if current.request.matches(&sentence) => Ok(sentence),
            None => return Some(sentence),
        };

        if let Some(current) = pending.take() {
            let _ = current.tx.send(reply);
        }
        None
    }

    /// Fail the pending command with `Disconnected`
    pub fn cancel_pending(&self) {
        if let Some(current) = self.pending.lock().take() {
            let _ = current.tx.send(Err(CommandError::Disconnected));
        }
    }

    fn take_pending(&self, token: Uuid) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.token == token) {
            pending.take();
        }
    }

    fn finish(&self, mut command: Command, state: CommandState, error: CommandError) -> CommandError {
        command.state = state;
        *self.last.lock() = Some(command);
        error
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(DispatchOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    /// Answers with `reply` once `ignore` sends have been swallowed
    struct ScriptedSink {
        dispatcher: Arc<CommandDispatcher>,
        reply: Option<AsciiSentence>,
        ignore: u32,
        sends: AtomicU32,
    }

    impl ScriptedSink {
        fn new(dispatcher: &Arc<CommandDispatcher>, reply: Option<AsciiSentence>, ignore: u32) -> Self {
            Self {
                dispatcher: Arc::clone(dispatcher),
                reply,
                ignore,
                sends: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CommandSink for ScriptedSink {
        async fn send_frame(&self, bytes: &[u8]) -> Result<(), CommandError> {
            assert!(bytes.starts_with(b"$VN"));
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if n >= self.ignore {
                if let Some(reply) = &self.reply {
                    assert!(self.dispatcher.offer(reply.clone()).is_none());
                }
            }
            Ok(())
        }
    }

    fn options(timeout_ms: u64, attempts: u32) -> DispatchOptions {
        DispatchOptions {
            timeout: Duration::from_millis(timeout_ms),
            attempts,
            checksum: ChecksumMode::Crc16,
        }
    }

    #[tokio::test]
    async fn test_response_fulfils_command() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(100, 3)));
        let reply = AsciiSentence::new("RRG", ["1", "VN-100"]);
        let sink = ScriptedSink::new(&dispatcher, Some(reply.clone()), 0);

        let response = dispatcher
            .execute(&sink, CommandRequest::ReadRegister { id: 1 })
            .await
            .unwrap();
        assert_eq!(response, reply);
        let last = dispatcher.last_command().unwrap();
        assert_eq!(last.state, CommandState::Fulfilled);
        assert_eq!(last.retries, 0);
        assert!(!dispatcher.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_attempts_times_timeout() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(100, 3)));
        let sink = ScriptedSink::new(&dispatcher, None, 0);

        let start = Instant::now();
        let result = dispatcher.execute(&sink, CommandRequest::ReadRegister { id: 1 }).await;
        assert!(matches!(result, Err(CommandError::Timeout { attempts: 3 })));
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(sink.sends.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.last_command().unwrap().state, CommandState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(50, 3)));
        let sink = ScriptedSink::new(&dispatcher, Some(AsciiSentence::new("WNV", Vec::<String>::new())), 2);

        let start = Instant::now();
        assert!(dispatcher.execute(&sink, CommandRequest::WriteSettings).await.is_ok());
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(dispatcher.last_command().unwrap().retries, 2);
    }

    #[tokio::test]
    async fn test_sensor_error_fails_command() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(100, 3)));
        let sink = ScriptedSink::new(&dispatcher, Some(AsciiSentence::new("ERR", ["08"])), 0);

        let result = dispatcher.execute(&sink, CommandRequest::ReadRegister { id: 250 }).await;
        assert!(matches!(
            result,
            Err(CommandError::Sensor(SensorError::InvalidRegister))
        ));
        assert_eq!(dispatcher.last_command().unwrap().state, CommandState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_asynchronous_error_leaves_command_pending() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(100, 1)));
        let sink = ScriptedSink::new(&dispatcher, None, 0);

        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let sink = sink;
                dispatcher.execute(&sink, CommandRequest::ReadRegister { id: 1 }).await
            })
        };
        while !dispatcher.has_pending() {
            tokio::task::yield_now().await;
        }

        let watchdog = AsciiSentence::new("ERR", ["0A"]);
        assert_eq!(dispatcher.offer(watchdog.clone()), Some(watchdog));
        assert!(dispatcher.has_pending());

        let reply = AsciiSentence::new("RRG", ["1", "VN-100"]);
        assert!(dispatcher.offer(reply.clone()).is_none());
        assert_eq!(worker.await.unwrap().unwrap(), reply);
    }

    #[tokio::test]
    async fn test_malformed_response_fails_command() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(100, 3)));
        let sink = ScriptedSink::new(&dispatcher, Some(AsciiSentence::new("RRG", ["8", "1.0"])), 0);

        let result = dispatcher
            .execute_decoded(&sink, CommandRequest::ReadRegister { id: 8 }, options(100, 3), |r| {
                crate::core::register::decode_response(8, r)
            })
            .await;
        assert!(matches!(result, Err(CommandError::Codec(_))));
        assert_eq!(sink.sends.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.last_command().unwrap().state, CommandState::Failed);
    }

    #[tokio::test]
    async fn test_unmatched_sentence_is_returned() {
        let dispatcher = CommandDispatcher::default();
        let stray = AsciiSentence::new("RRG", ["5", "115200", "0"]);
        assert_eq!(dispatcher.offer(stray.clone()), Some(stray));
    }

    #[tokio::test]
    async fn test_busy_refuses_commands() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(10, 1)));
        let sink = ScriptedSink::new(&dispatcher, None, 0);

        let guard = dispatcher.acquire_exclusive().await;
        assert!(dispatcher.is_busy());
        let result = dispatcher.execute(&sink, CommandRequest::Reset).await;
        assert!(matches!(result, Err(CommandError::Busy)));
        assert_eq!(sink.sends.load(Ordering::SeqCst), 0);

        drop(guard);
        assert!(!dispatcher.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_pending_reports_disconnect() {
        let dispatcher = Arc::new(CommandDispatcher::new(options(5_000, 1)));
        let sink = ScriptedSink::new(&dispatcher, None, 0);

        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let sink = sink;
                dispatcher.execute(&sink, CommandRequest::Reset).await
            })
        };
        while !dispatcher.has_pending() {
            tokio::task::yield_now().await;
        }
        dispatcher.cancel_pending();
        let result = worker.await.unwrap();
        assert!(matches!(result, Err(CommandError::Disconnected)));
    }
}
