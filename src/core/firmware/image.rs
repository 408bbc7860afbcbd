//! Firmware images and update manifests

use super::FirmwareUpdateError;
use crate::core::protocol::checksum::crc32;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Largest chunk that still fits a `BLD,W` sentence as hex
pub const MAX_CHUNK_SIZE: usize = 480;

/// Independently updatable processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Processor {
    /// Navigation processor
    Nav,
    /// GNSS receiver
    Gnss,
    /// IMU processor
    Imu,
}

impl Processor {
    /// Every processor in update order
    pub const ALL: [Processor; 3] = [Processor::Nav, Processor::Gnss, Processor::Imu];

    /// Name used in bootloader sentences and manifests
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nav => "nav",
            Self::Gnss => "gnss",
            Self::Imu => "imu",
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Processor {
    type Err = FirmwareUpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nav" => Ok(Self::Nav),
            "gnss" => Ok(Self::Gnss),
            "imu" => Ok(Self::Imu),
            other => Err(FirmwareUpdateError::Manifest(format!("unknown processor {other:?}"))),
        }
    }
}

/// A slice of the image at a fixed offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareChunk {
    /// Byte offset in the image
    pub offset: u32,
    /// Chunk bytes
    pub data: Bytes,
}

/// Firmware image split into transfer chunks
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// Target processor
    pub processor: Processor,
    /// Chunks in offset order
    pub chunks: Vec<FirmwareChunk>,
    /// Image size in bytes
    pub total_size: u32,
    /// CRC32 of the whole image
    pub crc32: u32,
}

impl FirmwareImage {
    /// Split `data` into chunks of `chunk_size` bytes
    pub fn from_bytes(
        processor: Processor,
        data: impl Into<Bytes>,
        chunk_size: usize,
    ) -> Result<Self, FirmwareUpdateError> {
        let data: Bytes = data.into();
        if data.is_empty() {
            return Err(FirmwareUpdateError::Image(format!("{processor} image is empty")));
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(FirmwareUpdateError::Image(format!(
                "chunk size {chunk_size} outside 1..={MAX_CHUNK_SIZE}"
            )));
        }
        let total_size = u32::try_from(data.len())
            .map_err(|_| FirmwareUpdateError::Image(format!("{processor} image is too large")))?;

        let chunks = (0..data.len())
            .step_by(chunk_size)
            .map(|start| FirmwareChunk {
                offset: start as u32,
                data: data.slice(start..(start + chunk_size).min(data.len())),
            })
            .collect();

        Ok(Self {
            processor,
            chunks,
            total_size,
            crc32: crc32(&data),
        })
    }

    /// Read an image file
    pub async fn from_file(
        processor: Processor,
        path: impl AsRef<Path>,
        chunk_size: usize,
    ) -> Result<Self, FirmwareUpdateError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| FirmwareUpdateError::Image(format!("{}: {e}", path.display())))?;
        Self::from_bytes(processor, data, chunk_size)
    }

    /// Number of chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// One manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Target processor
    pub processor: Processor,
    /// Image path, relative to the manifest
    pub path: PathBuf,
}

/// List of images to flash, in order
///
/// ```toml
/// [[image]]
/// processor = "nav"
/// path = "nav.bin"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Images in update order
    #[serde(rename = "image", default)]
    pub images: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse a manifest; `.json` files are JSON, anything else TOML
    ///
    /// Relative image paths are resolved against the manifest directory.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FirmwareUpdateError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FirmwareUpdateError::Manifest(format!("{}: {e}", path.display())))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut manifest: Manifest = if is_json {
            serde_json::from_str(&content).map_err(|e| FirmwareUpdateError::Manifest(e.to_string()))?
        } else {
            toml::from_str(&content).map_err(|e| FirmwareUpdateError::Manifest(e.to_string()))?
        };

        if manifest.images.is_empty() {
            return Err(FirmwareUpdateError::Manifest(format!(
                "{} lists no images",
                path.display()
            )));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for entry in &mut manifest.images {
            if entry.path.is_relative() {
                entry.path = base.join(&entry.path);
            }
        }
        Ok(manifest)
    }
}

/// Image paths for a direct update; processors without a path are skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorPaths {
    /// Navigation processor image
    pub nav: Option<PathBuf>,
    /// GNSS receiver image
    pub gnss: Option<PathBuf>,
    /// IMU processor image
    pub imu: Option<PathBuf>,
}

impl ProcessorPaths {
    /// Entries in update order
    pub fn entries(&self) -> Vec<ManifestEntry> {
        Processor::ALL
            .into_iter()
            .zip([&self.nav, &self.gnss, &self.imu])
            .filter_map(|(processor, path)| {
                path.clone().map(|path| ManifestEntry { processor, path })
            })
            .collect()
    }
}
