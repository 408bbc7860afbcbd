//! Checksum algorithms used on the wire
//!
//! ASCII sentences carry either an 8-bit XOR or a CRC-16 in hex after `*`.
//! Binary packets carry a big-endian CRC-16. Firmware images are verified
//! with CRC-32.

use serde::{Deserialize, Serialize};

/// Checksum carried by outgoing ASCII sentences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    /// 8-bit XOR, two hex digits
    Xor8,
    /// CRC-16, four hex digits
    #[default]
    Crc16,
}

impl ChecksumMode {
    /// Number of hex digits written after `*`
    pub fn hex_digits(self) -> usize {
        match self {
            Self::Xor8 => 2,
            Self::Crc16 => 4,
        }
    }

    /// Mode implied by the number of hex digits in a received checksum field
    pub fn from_hex_digits(digits: usize) -> Option<Self> {
        match digits {
            2 => Some(Self::Xor8),
            4 => Some(Self::Crc16),
            _ => None,
        }
    }

    /// Compute the checksum of `data` in this mode
    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            Self::Xor8 => u16::from(xor8(data)),
            Self::Crc16 => crc16(data),
        }
    }

    /// Format a checksum value with the width this mode uses
    pub fn format(self, value: u16) -> String {
        match self {
            Self::Xor8 => format!("{:02X}", value & 0xFF),
            Self::Crc16 => format!("{value:04X}"),
        }
    }
}

/// XOR of all bytes
pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// CRC-16 with polynomial 0x1021 and zero init (XMODEM parameters)
///
/// Running the CRC over a message followed by its big-endian CRC yields zero.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;

    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

/// CRC-32 (IEEE 802.3), used for whole-image verification
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finish()
}

/// Incremental CRC-32 so large images can be hashed chunk by chunk
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Start a new CRC-32 computation
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.state ^ u32::from(byte)) & 0xFF) as usize;
            self.state = CRC32_TABLE[index] ^ (self.state >> 8);
        }
    }

    /// Final CRC value
    pub fn finish(self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

// Reflected polynomial 0xEDB88320, generated at compile time.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor8() {
        assert_eq!(xor8(&[0x01, 0x02, 0x03]), 0x00);
        assert_eq!(xor8(&[0xFF, 0x00]), 0xFF);
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc16_residue_is_zero() {
        let body = b"VNRRG,05,115200,1";
        let crc = crc16(body);
        let mut framed = body.to_vec();
        framed.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(crc16(&framed), 0);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut hasher = Crc32::new();
        for chunk in data.chunks(37) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finish(), crc32(&data));
    }

    #[test]
    fn test_mode_formatting() {
        assert_eq!(ChecksumMode::Xor8.format(0x5A), "5A");
        assert_eq!(ChecksumMode::Crc16.format(0x0A1F), "0A1F");
        assert_eq!(ChecksumMode::from_hex_digits(4), Some(ChecksumMode::Crc16));
        assert_eq!(ChecksumMode::from_hex_digits(3), None);
    }
}
