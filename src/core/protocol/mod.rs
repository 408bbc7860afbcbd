//! Wire protocol
//!
//! Provides the framing layer shared by commands, telemetry and the bootloader:
//! - Checksum algorithms (XOR-8, CRC-16, CRC-32)
//! - ASCII sentences (`$VN...*CS`)
//! - Binary packet headers
//! - The streaming frame decoder

pub mod ascii;
pub mod binary;
pub mod checksum;
pub mod framing;

pub use ascii::{build_sentence, AsciiSentence};
pub use binary::{BinaryHeader, OutputGroup};
pub use checksum::ChecksumMode;
pub use framing::{DecoderStats, FrameDecoder, FrameKind, RawFrame};

use thiserror::Error;

/// Reasons a frame candidate is rejected
///
/// These never reach callers: the decoder counts them and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Checksum or CRC did not match
    #[error("checksum mismatch: carried {expected:04X}, computed {computed:04X}")]
    ChecksumMismatch {
        /// Value carried by the frame
        expected: u16,
        /// Value computed over the frame
        computed: u16,
    },

    /// Sentence has no usable checksum field
    #[error("missing or malformed checksum field")]
    MissingChecksum,

    /// Sentence does not start with `$`
    #[error("missing lead character")]
    MissingLead,

    /// Sentence has an empty header
    #[error("empty sentence header")]
    EmptyHeader,

    /// Non-printable byte inside an ASCII candidate
    #[error("non-ASCII byte in sentence")]
    NotAscii,

    /// Binary header names groups or fields that are not decoded
    #[error("invalid binary header")]
    InvalidHeader,

    /// Candidate exceeds the maximum frame size
    #[error("frame too long")]
    TooLong,

    /// Incomplete binary candidate followed by a complete sentence
    #[error("binary candidate superseded by a later sentence")]
    Superseded,
}

impl FrameError {
    /// Whether this rejection is a failed integrity check on a complete candidate
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::MissingChecksum)
    }
}
