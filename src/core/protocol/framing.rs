//! Frame decoder
//!
//! Turns the raw byte stream into validated [`RawFrame`]s. ASCII sentences
//! start at `$` and end at a line terminator; binary packets start at the
//! sync byte and have a length implied by their header. A candidate whose
//! checksum fails is dropped and the scan resumes one byte later, so a stray
//! sync byte inside a payload never costs the frames that follow it.

use super::ascii::verify_sentence;
use super::binary::{BinaryHeader, HeaderParse, SYNC};
use super::checksum::crc16;
use super::FrameError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

/// Lead character of ASCII sentences
pub const ASCII_LEAD: u8 = b'$';

/// Longest ASCII sentence accepted, terminator included
pub const MAX_ASCII_LEN: usize = 1024;

/// Longest binary packet accepted
pub const MAX_BINARY_LEN: usize = 1024;

/// Frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `$...*CS\r\n` sentence
    Ascii,
    /// Sync-prefixed binary packet
    Binary,
}

/// A complete frame that passed its integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Frame kind
    pub kind: FrameKind,
    /// Frame bytes. ASCII frames exclude the line terminator; binary frames
    /// include sync byte and CRC.
    pub bytes: Bytes,
    /// Checksum or CRC carried by the frame
    pub checksum: u16,
    /// Header of a binary frame
    pub header: Option<BinaryHeader>,
}

impl RawFrame {
    /// Payload of a binary frame (between header and CRC)
    pub fn binary_payload(&self) -> Option<&[u8]> {
        let header = self.header?;
        let start = 1 + header.encoded_len();
        let end = self.bytes.len().checked_sub(2)?;
        self.bytes.get(start..end)
    }
}

/// Decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames emitted
    pub frames: u64,
    /// Candidates dropped on checksum/CRC mismatch
    pub drops: u64,
    /// Bytes discarded while searching for a start marker
    pub skipped_bytes: u64,
}

enum Step {
    Frame(RawFrame),
    Reject(FrameError),
    NeedMore,
}

/// Streaming frame decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    stats: DecoderStats,
    skipped: Option<Vec<u8>>,
}

impl FrameDecoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every frame now complete
    pub fn push(&mut self, data: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(data);
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(&mut buffer) {
            frames.push(frame);
        }
        self.buffer = buffer;
        frames
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Counters since creation or the last reset
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop buffered bytes and counters
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stats = DecoderStats::default();
        if let Some(skipped) = &mut self.skipped {
            skipped.clear();
        }
    }

    /// Keep a copy of every byte discarded outside a valid frame
    ///
    /// Collected bytes accumulate until [`take_skipped`](Self::take_skipped).
    pub fn capture_skipped(&mut self, enabled: bool) {
        self.skipped = enabled.then(Vec::new);
    }

    /// Bytes discarded since the last call, empty unless capturing
    pub fn take_skipped(&mut self) -> Vec<u8> {
        self.skipped.as_mut().map(std::mem::take).unwrap_or_default()
    }

    fn discard(&mut self, buf: &mut BytesMut, n: usize) {
        if let Some(skipped) = &mut self.skipped {
            skipped.extend_from_slice(&buf[..n]);
        }
        buf.advance(n);
    }

    fn next_frame(&mut self, buf: &mut BytesMut) -> Option<RawFrame> {
        loop {
            let start = buf.iter().position(|&b| b == ASCII_LEAD || b == SYNC);
            match start {
                Some(0) => {}
                Some(n) => {
                    self.stats.skipped_bytes += n as u64;
                    self.discard(buf, n);
                }
                None => {
                    self.stats.skipped_bytes += buf.len() as u64;
                    let n = buf.len();
                    self.discard(buf, n);
                    return None;
                }
            }

            let step = if buf[0] == ASCII_LEAD {
                Self::try_ascii(buf)
            } else {
                Self::try_binary(buf)
            };

            match step {
                Step::Frame(frame) => {
                    self.stats.frames += 1;
                    return Some(frame);
                }
                Step::NeedMore => return None,
                Step::Reject(err) => {
                    if err.is_integrity_failure() {
                        self.stats.drops += 1;
                        trace!(error = %err, "dropping frame candidate");
                    } else {
                        self.stats.skipped_bytes += 1;
                    }
                    self.discard(buf, 1);
                }
            }
        }
    }

    fn try_ascii(buf: &mut BytesMut) -> Step {
        let mut end = None;
        for (i, &b) in buf.iter().enumerate().skip(1) {
            if b == b'\n' {
                end = Some(i);
                break;
            }
            let printable = (0x20..=0x7E).contains(&b);
            let carriage_return = b == b'\r' && buf.get(i + 1).map_or(true, |&n| n == b'\n');
            if !printable && !carriage_return {
                return Step::Reject(FrameError::NotAscii);
            }
            if i + 1 >= MAX_ASCII_LEN {
                return Step::Reject(FrameError::TooLong);
            }
        }

        let Some(end) = end else {
            return Step::NeedMore;
        };

        let mut candidate_end = end;
        if candidate_end > 0 && buf[candidate_end - 1] == b'\r' {
            candidate_end -= 1;
        }

        match verify_sentence(&buf[..candidate_end]) {
            Ok(checksum) => {
                let bytes = buf.split_to(end + 1).freeze().slice(..candidate_end);
                Step::Frame(RawFrame {
                    kind: FrameKind::Ascii,
                    bytes,
                    checksum,
                    header: None,
                })
            }
            Err(err) => Step::Reject(err),
        }
    }

    fn try_binary(buf: &mut BytesMut) -> Step {
        let header = match BinaryHeader::parse(&buf[1..]) {
            HeaderParse::Incomplete => return Self::wait_for_binary(buf),
            HeaderParse::Invalid => return Step::Reject(FrameError::InvalidHeader),
            HeaderParse::Valid(header) => header,
        };

        let len = header.packet_len();
        if len > MAX_BINARY_LEN {
            return Step::Reject(FrameError::TooLong);
        }
        if buf.len() < len {
            return Self::wait_for_binary(buf);
        }

        let residue = crc16(&buf[1..len]);
        if residue != 0 {
            let carried = u16::from_be_bytes([buf[len - 2], buf[len - 1]]);
            return Step::Reject(FrameError::ChecksumMismatch {
                expected: carried,
                computed: crc16(&buf[1..len - 2]),
            });
        }

        let checksum = u16::from_be_bytes([buf[len - 2], buf[len - 1]]);
        Step::Frame(RawFrame {
            kind: FrameKind::Binary,
            bytes: buf.split_to(len).freeze(),
            checksum,
            header: Some(header),
        })
    }
}

impl FrameDecoder {
    /// Keep waiting on an incomplete binary candidate unless a complete valid
    /// sentence already follows its sync byte. A real packet cannot be
    /// followed by anything before it is complete, so such a candidate is
    /// noise.
    fn wait_for_binary(buf: &BytesMut) -> Step {
        if holds_complete_sentence(&buf[1..]) {
            Step::Reject(FrameError::Superseded)
        } else {
            Step::NeedMore
        }
    }
}

/// Whether `bytes` contain a printable `$...*CS` sentence with a valid
/// checksum and its line terminator
fn holds_complete_sentence(bytes: &[u8]) -> bool {
    let mut rest = bytes;
    while let Some(lead) = rest.iter().position(|&b| b == ASCII_LEAD) {
        rest = &rest[lead..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            return false;
        };
        let mut end = newline;
        if end > 0 && rest[end - 1] == b'\r' {
            end -= 1;
        }
        let candidate = &rest[..end];
        if candidate.len() <= MAX_ASCII_LEN
            && candidate.iter().all(|b| (0x20..=0x7E).contains(b))
            && verify_sentence(candidate).is_ok()
        {
            return true;
        }
        rest = &rest[1..];
    }
    false
}

impl Decoder for FrameDecoder {
    type Item = RawFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_frame(src))
    }
}

/// Build a binary packet from a header and payload, appending the CRC
pub fn encode_binary(header: &BinaryHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.packet_len());
    out.push(SYNC);
    header.write(&mut out);
    out.extend_from_slice(payload);
    let crc = crc16(&out[1..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ascii::build_sentence;
    use crate::core::protocol::binary::OutputGroup;
    use crate::core::protocol::checksum::ChecksumMode;

    fn ypr_packet(seed: u8) -> Vec<u8> {
        let mut masks = [0u16; 6];
        masks[OutputGroup::Attitude.index()] = 1 << 1;
        let header = BinaryHeader::new(masks);
        let payload: Vec<u8> = (0..12).map(|i| seed.wrapping_add(i)).collect();
        encode_binary(&header, &payload)
    }

    #[test]
    fn test_ascii_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&build_sentence("VNYPR,1.0,2.0,3.0", ChecksumMode::Crc16));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Ascii);
        assert!(frames[0].bytes.starts_with(b"$VNYPR"));
        assert!(!frames[0].bytes.ends_with(b"\n"));
    }

    #[test]
    fn test_partial_frames_wait() {
        let mut decoder = FrameDecoder::new();
        let bytes = build_sentence("VNRRG,1,VN-100", ChecksumMode::Xor8);
        let (a, b) = bytes.split_at(7);
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.buffered(), 7);
        assert_eq!(decoder.push(b).len(), 1);
        assert_eq!(decoder.buffered(), 0);

        let packet = ypr_packet(3);
        assert!(decoder.push(&packet[..4]).is_empty());
        let frames = decoder.push(&packet[4..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Binary);
        assert_eq!(frames[0].binary_payload().map(<[u8]>::len), Some(12));
    }

    #[test]
    fn test_noise_is_skipped() {
        let mut decoder = FrameDecoder::new();
        let mut stream = b"garbage\x00\x01".to_vec();
        stream.extend_from_slice(&build_sentence("VNYPR,1,2,3", ChecksumMode::Crc16));
        let frames = decoder.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.stats().skipped_bytes, 9);
        assert_eq!(decoder.stats().drops, 0);
    }

    #[test]
    fn test_skipped_bytes_are_captured() {
        let mut decoder = FrameDecoder::new();
        let mut stream = b"ab".to_vec();
        stream.extend_from_slice(&build_sentence("VNYPR,1,2,3", ChecksumMode::Crc16));
        stream.extend_from_slice(b"\x00z");

        decoder.push(&stream);
        assert!(decoder.take_skipped().is_empty());

        decoder.capture_skipped(true);
        let frames = decoder.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.take_skipped(), b"ab\x00z".to_vec());
        assert!(decoder.take_skipped().is_empty());
    }

    #[test]
    fn test_bad_checksum_counts_drop() {
        let mut decoder = FrameDecoder::new();
        let mut stream = b"$VNYPR,1,2,3*0000\r\n".to_vec();
        stream.extend_from_slice(&build_sentence("VNYPR,1,2,3", ChecksumMode::Crc16));
        let frames = decoder.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.stats().drops, 1);
    }

    #[test]
    fn test_spurious_sync_is_skipped() {
        let mut decoder = FrameDecoder::new();
        // extension group bit set: not a header this decoder accepts
        let mut stream = vec![SYNC, 0x80];
        stream.extend_from_slice(&ypr_packet(9));
        let frames = decoder.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Binary);
    }

    #[test]
    fn test_partial_sync_candidate_does_not_hold_sentences() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![SYNC, 0x01, 0xFF, 0x7F];
        stream.extend_from_slice(&build_sentence("VNRRG,1,VN-100", ChecksumMode::Crc16));
        let frames = decoder.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Ascii);
        assert!(frames[0].bytes.starts_with(b"$VNRRG,1,VN-100*"));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.stats().skipped_bytes, 4);

        // same noise with the sentence arriving in a later read
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&[SYNC, 0x01, 0xFF]).is_empty());
        assert!(decoder.push(&[0x7F]).is_empty());
        let frames = decoder.push(&build_sentence("VNRRG,1,VN-100", ChecksumMode::Xor8));
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_packet_waits_without_a_complete_sentence() {
        let mut decoder = FrameDecoder::new();
        let packet = ypr_packet(5);
        let mut stream = packet[..8].to_vec();
        // a sentence lead without its terminator proves nothing yet
        stream.extend_from_slice(b"$VNYPR,1");
        assert!(decoder.push(&stream).is_empty());
        assert_eq!(decoder.buffered(), stream.len());
    }

    #[test]
    fn test_codec_decoder_impl() {
        let mut decoder = FrameDecoder::new();
        let mut src = BytesMut::from(&build_sentence("VNYPR,1,2,3", ChecksumMode::Xor8)[..]);
        let frame = decoder.decode(&mut src).unwrap();
        assert!(frame.is_some());
        assert!(src.is_empty());
    }
}
