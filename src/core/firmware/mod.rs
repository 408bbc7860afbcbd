//! Firmware update
//!
//! Images are loaded from files or a manifest, split into chunks and pushed
//! through the bootloader sub-protocol one processor at a time.

mod image;
mod updater;

pub use image::{
    FirmwareChunk, FirmwareImage, Manifest, ManifestEntry, Processor, ProcessorPaths,
    MAX_CHUNK_SIZE,
};
pub use updater::{
    BootloaderLink, FirmwareUpdater, ProcessorOutcome, ProcessorReport, UpdateParams,
    UpdateReport, UpdateSession, UpdateState, BOOTLOADER_KEYWORD, ENTER_KEYWORD,
};

use crate::core::transport::ConnectionError;
use thiserror::Error;

/// Firmware update error types
#[derive(Error, Debug)]
pub enum FirmwareUpdateError {
    /// Image could not be read or is unusable
    #[error("Firmware image error: {0}")]
    Image(String),

    /// Manifest could not be read or parsed
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Bootloader never reported ready
    #[error("Bootloader for {processor} did not respond")]
    BootloaderNoResponse {
        /// Processor
        processor: Processor,
    },

    /// A chunk was not acknowledged
    #[error("Chunk at offset {offset:#010X} for {processor} failed after {attempts} attempts")]
    ChunkFailed {
        /// Processor
        processor: Processor,
        /// Chunk offset
        offset: u32,
        /// Sends performed
        attempts: u32,
    },

    /// Image check failed
    #[error("Verification of {processor} failed: {reason}")]
    VerifyFailed {
        /// Processor
        processor: Processor,
        /// Reason reported by the bootloader
        reason: String,
    },

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] ConnectionError),

    /// Another update or command holds the connection
    #[error("Sensor is busy")]
    Busy,
}

/// Load every image listed in `entries`
pub(crate) async fn load_images(
    entries: &[ManifestEntry],
    chunk_size: usize,
) -> Result<Vec<FirmwareImage>, FirmwareUpdateError> {
    let mut images = Vec::with_capacity(entries.len());
    for entry in entries {
        images.push(FirmwareImage::from_file(entry.processor, &entry.path, chunk_size).await?);
    }
    Ok(images)
}
