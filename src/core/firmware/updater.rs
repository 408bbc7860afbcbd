//! Bootloader state machine
//!
//! Each processor goes through
//! `Idle -> EnteringBootloader -> Transferring -> Verifying -> Complete`,
//! or ends in `Aborted` on the first unrecoverable step. Processors are
//! updated one after another and the run stops at the first failure.

use super::image::{FirmwareImage, Processor};
use super::FirmwareUpdateError;
use crate::config::FirmwareSettings;
use crate::core::protocol::AsciiSentence;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Bootloader sentence keyword
pub const BOOTLOADER_KEYWORD: &str = "BLD";

/// Keyword that switches a processor into its bootloader
pub const ENTER_KEYWORD: &str = "SBL";

/// Exclusive channel to the sensor while it is in bootloader mode
#[async_trait]
pub trait BootloaderLink: Send {
    /// Send one sentence
    async fn send_sentence(&mut self, sentence: &AsciiSentence) -> Result<(), FirmwareUpdateError>;

    /// Next sentence from the sensor, `None` once `timeout` elapses
    async fn recv_sentence(&mut self, timeout: Duration) -> Option<AsciiSentence>;

    /// Change the host-side baud rate
    async fn set_host_baud_rate(&mut self, baud: u32) -> Result<(), FirmwareUpdateError>;
}

/// Baud rates used around the update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateParams {
    /// Rate the sensor runs at before and after the update
    pub firmware_baud_rate: u32,
    /// Rate used while the bootloader is active
    pub bootloader_baud_rate: u32,
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            firmware_baud_rate: 115_200,
            bootloader_baud_rate: 115_200,
        }
    }
}

/// Update state of one processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Not started
    Idle,
    /// Waiting for the bootloader to report ready
    EnteringBootloader,
    /// Sending chunks
    Transferring,
    /// Waiting for the image check
    Verifying,
    /// Image written and verified
    Complete,
    /// Update gave up
    Aborted,
}

/// Progress record of one processor update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    /// Processor being updated
    pub processor: Processor,
    /// Current state
    pub state: UpdateState,
    /// Chunk being transferred
    pub chunk_index: usize,
    /// Chunks in the image
    pub chunk_count: usize,
    /// Resends across all steps
    pub retries: u32,
    /// `BLD,W` sentences sent
    pub chunks_sent: u32,
    /// Chunk sends beyond the first per chunk
    pub retransmissions: u32,
}

impl UpdateSession {
    /// Session for `processor` in the idle state
    pub fn new(processor: Processor, chunk_count: usize) -> Self {
        Self {
            processor,
            state: UpdateState::Idle,
            chunk_index: 0,
            chunk_count,
            retries: 0,
            chunks_sent: 0,
            retransmissions: 0,
        }
    }
}

/// Result for one processor
#[derive(Debug)]
pub enum ProcessorOutcome {
    /// Updated and verified
    Complete(UpdateSession),
    /// Aborted
    Failed {
        /// State when the update gave up
        session: UpdateSession,
        /// Why
        error: FirmwareUpdateError,
    },
    /// Skipped because an earlier processor failed
    NotAttempted,
}

/// One line of an [`UpdateReport`]
#[derive(Debug)]
pub struct ProcessorReport {
    /// Processor
    pub processor: Processor,
    /// Outcome
    pub outcome: ProcessorOutcome,
}

/// Outcome of a multi-processor update
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Per-processor results in update order
    pub processors: Vec<ProcessorReport>,
}

impl UpdateReport {
    /// Whether every processor completed
    pub fn is_success(&self) -> bool {
        self.processors
            .iter()
            .all(|p| matches!(p.outcome, ProcessorOutcome::Complete(_)))
    }

    /// Error of the processor that stopped the run
    pub fn first_error(&self) -> Option<&FirmwareUpdateError> {
        self.processors.iter().find_map(|p| match &p.outcome {
            ProcessorOutcome::Failed { error, .. } => Some(error),
            _ => None,
        })
    }

    /// Session record of `processor`, if it was attempted
    pub fn session(&self, processor: Processor) -> Option<&UpdateSession> {
        self.processors
            .iter()
            .find(|p| p.processor == processor)
            .and_then(|p| match &p.outcome {
                ProcessorOutcome::Complete(session) => Some(session),
                ProcessorOutcome::Failed { session, .. } => Some(session),
                ProcessorOutcome::NotAttempted => None,
            })
    }
}

fn bld(fields: &[&str]) -> AsciiSentence {
    AsciiSentence::new(BOOTLOADER_KEYWORD, fields.iter().copied())
}

fn bootloader_reply(sentence: &AsciiSentence) -> Option<(&str, &[String])> {
    if sentence.keyword() != BOOTLOADER_KEYWORD {
        return None;
    }
    let (kind, rest) = sentence.fields.split_first()?;
    Some((kind.as_str(), rest))
}

fn parse_offset(field: Option<&String>) -> Option<u32> {
    u32::from_str_radix(field?.trim(), 16).ok()
}

enum ChunkReply {
    Ack,
    Nak(String),
}

/// Drives the bootloader protocol over a [`BootloaderLink`]
pub struct FirmwareUpdater<'a, L: BootloaderLink> {
    link: &'a mut L,
    settings: FirmwareSettings,
    params: UpdateParams,
}

impl<'a, L: BootloaderLink> FirmwareUpdater<'a, L> {
    /// Updater using `link`
    pub fn new(link: &'a mut L, settings: FirmwareSettings, params: UpdateParams) -> Self {
        Self {
            link,
            settings,
            params,
        }
    }

    /// Update every image in order, stopping at the first failure
    pub async fn run(&mut self, images: &[FirmwareImage]) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut failed = false;

        for image in images {
            let processor = image.processor;
            if failed {
                report.processors.push(ProcessorReport {
                    processor,
                    outcome: ProcessorOutcome::NotAttempted,
                });
                continue;
            }

            let mut session = UpdateSession::new(processor, image.chunk_count());
            let outcome = match self.update_processor(image, &mut session).await {
                Ok(()) => {
                    info!(%processor, chunks = session.chunk_count, retransmissions = session.retransmissions, "firmware update complete");
                    ProcessorOutcome::Complete(session)
                }
                Err(error) => {
                    warn!(%processor, %error, "firmware update aborted");
                    self.abort(&mut session).await;
                    failed = true;
                    ProcessorOutcome::Failed { session, error }
                }
            };
            report.processors.push(ProcessorReport { processor, outcome });
        }

        report
    }

    async fn update_processor(
        &mut self,
        image: &FirmwareImage,
        session: &mut UpdateSession,
    ) -> Result<(), FirmwareUpdateError> {
        let processor = image.processor;

        session.state = UpdateState::EnteringBootloader;
        info!(%processor, size = image.total_size, chunks = image.chunk_count(), "entering bootloader");
        self.enter_bootloader(session).await?;
        self.link
            .set_host_baud_rate(self.params.bootloader_baud_rate)
            .await?;

        session.state = UpdateState::Transferring;
        for (index, chunk) in image.chunks.iter().enumerate() {
            session.chunk_index = index;
            let offset = format!("{:08X}", chunk.offset);
            let data = hex::encode_upper(&chunk.data);
            let sentence = bld(&["W", offset.as_str(), data.as_str()]);

            let mut attempt = 0;
            loop {
                attempt += 1;
                self.link.send_sentence(&sentence).await?;
                session.chunks_sent += 1;

                match self.await_chunk_reply(chunk.offset).await {
                    Some(ChunkReply::Ack) => break,
                    Some(ChunkReply::Nak(reason)) => {
                        debug!(%processor, offset = %offset, %reason, attempt, "chunk rejected");
                    }
                    None => debug!(%processor, offset = %offset, attempt, "chunk not acknowledged"),
                }

                if attempt >= self.settings.chunk_attempts {
                    return Err(FirmwareUpdateError::ChunkFailed {
                        processor,
                        offset: chunk.offset,
                        attempts: attempt,
                    });
                }
                session.retries += 1;
                session.retransmissions += 1;
            }
        }

        session.state = UpdateState::Verifying;
        let size = image.total_size.to_string();
        let crc = format!("{:08X}", image.crc32);
        self.link.send_sentence(&bld(&["V", size.as_str(), crc.as_str()])).await?;
        let verdict = self
            .expect(self.settings.verify_timeout(), |s| match bootloader_reply(s)? {
                ("VOK", _) => Some(Ok(())),
                ("VERR", rest) => Some(Err(rest.first().cloned().unwrap_or_default())),
                _ => None,
            })
            .await;
        match verdict {
            Some(Ok(())) => {}
            Some(Err(reason)) => return Err(FirmwareUpdateError::VerifyFailed { processor, reason }),
            None => {
                return Err(FirmwareUpdateError::VerifyFailed {
                    processor,
                    reason: "no verification result".to_string(),
                })
            }
        }

        self.exit_bootloader(processor).await;
        session.state = UpdateState::Complete;
        Ok(())
    }

    async fn enter_bootloader(&mut self, session: &mut UpdateSession) -> Result<(), FirmwareUpdateError> {
        let processor = session.processor;
        let baud = self.params.bootloader_baud_rate.to_string();
        let enter = AsciiSentence::new(ENTER_KEYWORD, [processor.as_str(), baud.as_str()]);

        for attempt in 1..=self.settings.enter_attempts {
            if attempt > 1 {
                session.retries += 1;
                debug!(%processor, attempt, "retrying bootloader entry");
            }
            self.link.send_sentence(&enter).await?;
            let ready = self
                .expect(self.settings.ack_timeout(), |s| match bootloader_reply(s)? {
                    ("RDY", rest) if rest.first().map(String::as_str) == Some(processor.as_str()) => Some(()),
                    _ => None,
                })
                .await;
            if ready.is_some() {
                return Ok(());
            }
        }
        Err(FirmwareUpdateError::BootloaderNoResponse { processor })
    }

    async fn await_chunk_reply(&mut self, offset: u32) -> Option<ChunkReply> {
        self.expect(self.settings.ack_timeout(), |s| match bootloader_reply(s)? {
            ("ACK", rest) if parse_offset(rest.first()) == Some(offset) => Some(ChunkReply::Ack),
            ("NAK", rest) if parse_offset(rest.first()) == Some(offset) => {
                Some(ChunkReply::Nak(rest.get(1).cloned().unwrap_or_default()))
            }
            _ => None,
        })
        .await
    }

    async fn exit_bootloader(&mut self, processor: Processor) {
        if let Err(error) = self.link.send_sentence(&bld(&["X"])).await {
            warn!(%processor, %error, "could not send bootloader exit");
        } else {
            let exited = self
                .expect(self.settings.ack_timeout(), |s| match bootloader_reply(s)? {
                    ("XOK", _) => Some(()),
                    _ => None,
                })
                .await;
            if exited.is_none() {
                debug!(%processor, "no exit acknowledgement");
            }
        }

        if let Err(error) = self.link.set_host_baud_rate(self.params.firmware_baud_rate).await {
            warn!(%processor, %error, "could not restore firmware baud rate");
        }
    }

    async fn abort(&mut self, session: &mut UpdateSession) {
        session.state = UpdateState::Aborted;
        self.exit_bootloader(session.processor).await;
    }

    /// Wait up to `timeout` for a sentence `accept` recognises, skipping others
    async fn expect<T>(
        &mut self,
        timeout: Duration,
        accept: impl Fn(&AsciiSentence) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let sentence = self.link.recv_sentence(remaining).await?;
            if let Some(value) = accept(&sentence) {
                return Some(value);
            }
            trace!(header = %sentence.header, "ignoring sentence during update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::checksum::crc32;
    use std::collections::VecDeque;

    /// Scripted bootloader answering synchronously
    #[derive(Default)]
    struct ScriptedLink {
        inbox: VecDeque<AsciiSentence>,
        written: Vec<u8>,
        bauds: Vec<u32>,
        silent: bool,
        nak_first_write: bool,
        writes: u32,
    }

    #[async_trait]
    impl BootloaderLink for ScriptedLink {
        async fn send_sentence(&mut self, sentence: &AsciiSentence) -> Result<(), FirmwareUpdateError> {
            if self.silent {
                return Ok(());
            }
            let reply = match (sentence.keyword(), sentence.field(0)) {
                ("SBL", Some(processor)) => bld(&["RDY", processor]),
                ("BLD", Some("W")) => {
                    self.writes += 1;
                    let offset = sentence.field(1).unwrap_or_default().to_string();
                    if self.nak_first_write && self.writes == 1 {
                        bld(&["NAK", offset.as_str(), "CRC"])
                    } else {
                        self.written
                            .extend(hex::decode(sentence.field(2).unwrap_or_default()).unwrap());
                        bld(&["ACK", offset.as_str()])
                    }
                }
                ("BLD", Some("V")) => {
                    let expected = format!("{:08X}", crc32(&self.written));
                    if sentence.field(2) == Some(expected.as_str()) {
                        bld(&["VOK"])
                    } else {
                        bld(&["VERR", "CRC"])
                    }
                }
                ("BLD", Some("X")) => bld(&["XOK"]),
                _ => return Ok(()),
            };
            self.inbox.push_back(reply);
            Ok(())
        }

        async fn recv_sentence(&mut self, timeout: Duration) -> Option<AsciiSentence> {
            match self.inbox.pop_front() {
                Some(sentence) => Some(sentence),
                None => {
                    tokio::time::sleep(timeout).await;
                    None
                }
            }
        }

        async fn set_host_baud_rate(&mut self, baud: u32) -> Result<(), FirmwareUpdateError> {
            self.bauds.push(baud);
            Ok(())
        }
    }

    fn settings() -> FirmwareSettings {
        FirmwareSettings {
            chunk_size: 16,
            ack_timeout_ms: 100,
            chunk_attempts: 3,
            enter_attempts: 2,
            verify_timeout_ms: 200,
        }
    }

    fn params() -> UpdateParams {
        UpdateParams {
            firmware_baud_rate: 115_200,
            bootloader_baud_rate: 921_600,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_is_retransmitted() {
        let data: Vec<u8> = (0..100u8).collect();
        let image = FirmwareImage::from_bytes(Processor::Nav, data.clone(), 16).unwrap();
        let mut link = ScriptedLink {
            nak_first_write: true,
            ..Default::default()
        };

        let report = FirmwareUpdater::new(&mut link, settings(), params())
            .run(std::slice::from_ref(&image))
            .await;
        assert!(report.is_success());
        let session = report.session(Processor::Nav).unwrap();
        assert_eq!(session.state, UpdateState::Complete);
        assert_eq!(session.retransmissions, 1);
        assert_eq!(session.chunks_sent, image.chunk_count() as u32 + 1);
        assert_eq!(link.written, data);
        assert_eq!(link.bauds, vec![921_600, 115_200]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_bootloader_aborts_and_skips_rest() {
        let nav = FirmwareImage::from_bytes(Processor::Nav, vec![1u8; 10], 16).unwrap();
        let imu = FirmwareImage::from_bytes(Processor::Imu, vec![2u8; 10], 16).unwrap();
        let mut link = ScriptedLink {
            silent: true,
            ..Default::default()
        };

        let start = Instant::now();
        let report = FirmwareUpdater::new(&mut link, settings(), params())
            .run(&[nav, imu])
            .await;
        assert!(!report.is_success());
        assert!(matches!(
            report.first_error(),
            Some(FirmwareUpdateError::BootloaderNoResponse {
                processor: Processor::Nav
            })
        ));
        assert_eq!(report.session(Processor::Nav).unwrap().state, UpdateState::Aborted);
        assert!(matches!(report.processors[1].outcome, ProcessorOutcome::NotAttempted));
        // two entry attempts plus the best-effort exit
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(link.bauds, vec![115_200]);
    }
}
