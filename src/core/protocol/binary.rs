//! Binary packet header
//!
//! A binary packet is `0xFA`, a group byte, one little-endian `u16` field mask
//! per group present (in group bit order), the packed payload, then a
//! big-endian CRC-16 over everything after the sync byte. Nothing in the
//! payload is self-describing: its length and layout follow from the masks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sync byte opening every binary packet
pub const SYNC: u8 = 0xFA;

/// Measurement groups of the binary output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputGroup {
    /// Mixed fields that populate other semantic groups
    Common,
    /// Time and synchronisation
    Time,
    /// Inertial sensor outputs
    Imu,
    /// GNSS receiver outputs
    Gnss,
    /// Attitude solution
    Attitude,
    /// Inertial navigation solution
    Ins,
}

// Field sizes indexed by field bit. Zero marks a bit the decoder does not accept.
const COMMON_SIZES: &[usize] = &[8, 8, 8, 12, 16, 12, 24, 12, 12, 24, 20, 28, 2, 4, 8];
const TIME_SIZES: &[usize] = &[8, 8, 8, 2, 8, 8, 8, 4, 4, 1];
const IMU_SIZES: &[usize] = &[2, 12, 12, 12, 4, 4, 16, 12, 12, 12, 12, 2];
const GNSS_SIZES: &[usize] = &[8, 8, 2, 1, 1, 24, 24, 12, 12, 12, 4, 4, 2, 28];
const ATTITUDE_SIZES: &[usize] = &[0, 12, 16, 36, 12, 12, 12, 12, 12];
const INS_SIZES: &[usize] = &[2, 24, 24, 12, 12, 12, 12, 12, 12, 4, 4];

impl OutputGroup {
    /// All groups in wire order
    pub const ALL: [OutputGroup; 6] = [
        OutputGroup::Common,
        OutputGroup::Time,
        OutputGroup::Imu,
        OutputGroup::Gnss,
        OutputGroup::Attitude,
        OutputGroup::Ins,
    ];

    /// Bit index in the group byte
    pub fn bit(self) -> u8 {
        match self {
            Self::Common => 0,
            Self::Time => 1,
            Self::Imu => 2,
            Self::Gnss => 3,
            Self::Attitude => 4,
            Self::Ins => 5,
        }
    }

    /// Index into per-group arrays
    pub fn index(self) -> usize {
        usize::from(self.bit())
    }

    fn field_sizes(self) -> &'static [usize] {
        match self {
            Self::Common => COMMON_SIZES,
            Self::Time => TIME_SIZES,
            Self::Imu => IMU_SIZES,
            Self::Gnss => GNSS_SIZES,
            Self::Attitude => ATTITUDE_SIZES,
            Self::Ins => INS_SIZES,
        }
    }

    /// Packed size of one field, `None` if the bit is not a known field
    pub fn field_size(self, bit: u8) -> Option<usize> {
        match self.field_sizes().get(usize::from(bit)) {
            Some(&size) if size > 0 => Some(size),
            _ => None,
        }
    }

    /// Whether every bit of `mask` names a known field
    pub fn accepts_mask(self, mask: u16) -> bool {
        mask != 0 && (0..16u8).filter(|b| mask & (1 << b) != 0).all(|b| self.field_size(b).is_some())
    }

    /// Payload bytes contributed by `mask`
    pub fn payload_len(self, mask: u16) -> usize {
        (0..16u8)
            .filter(|b| mask & (1 << b) != 0)
            .filter_map(|b| self.field_size(b))
            .sum()
    }
}

impl fmt::Display for OutputGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Common => "common",
            Self::Time => "time",
            Self::Imu => "imu",
            Self::Gnss => "gnss",
            Self::Attitude => "attitude",
            Self::Ins => "ins",
        };
        f.write_str(name)
    }
}

/// Outcome of looking at the bytes after a sync byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParse {
    /// More bytes needed
    Incomplete,
    /// Not a header this decoder understands
    Invalid,
    /// A complete header
    Valid(BinaryHeader),
}

/// Group byte plus the field mask of every group present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BinaryHeader {
    /// Field mask per group, indexed by [`OutputGroup::index`]; zero when absent
    pub masks: [u16; 6],
}

impl BinaryHeader {
    /// Header selecting the given masks
    pub fn new(masks: [u16; 6]) -> Self {
        Self { masks }
    }

    /// Group presence byte
    pub fn group_byte(&self) -> u8 {
        OutputGroup::ALL
            .iter()
            .filter(|g| self.masks[g.index()] != 0)
            .fold(0u8, |acc, g| acc | (1 << g.bit()))
    }

    /// Field mask of one group
    pub fn mask(&self, group: OutputGroup) -> u16 {
        self.masks[group.index()]
    }

    /// Groups present, in wire order
    pub fn groups(&self) -> impl Iterator<Item = OutputGroup> + '_ {
        OutputGroup::ALL
            .into_iter()
            .filter(move |g| self.masks[g.index()] != 0)
    }

    /// Whether any group is selected
    pub fn is_empty(&self) -> bool {
        self.masks.iter().all(|&m| m == 0)
    }

    /// Header size on the wire, excluding the sync byte
    pub fn encoded_len(&self) -> usize {
        1 + 2 * self.groups().count()
    }

    /// Payload size implied by the masks
    pub fn payload_len(&self) -> usize {
        self.groups().map(|g| g.payload_len(self.mask(g))).sum()
    }

    /// Full packet size including sync byte and CRC
    pub fn packet_len(&self) -> usize {
        1 + self.encoded_len() + self.payload_len() + 2
    }

    /// Parse a header from the bytes following the sync byte
    pub fn parse(buf: &[u8]) -> HeaderParse {
        let Some(&group_byte) = buf.first() else {
            return HeaderParse::Incomplete;
        };
        // Bits 6 and 7 (extension groups) are not decoded.
        if group_byte == 0 || group_byte & 0xC0 != 0 {
            return HeaderParse::Invalid;
        }

        let mut masks = [0u16; 6];
        let mut offset = 1;
        for group in OutputGroup::ALL {
            if group_byte & (1 << group.bit()) == 0 {
                continue;
            }
            let Some(bytes) = buf.get(offset..offset + 2) else {
                return HeaderParse::Incomplete;
            };
            let mask = u16::from_le_bytes([bytes[0], bytes[1]]);
            if !group.accepts_mask(mask) {
                return HeaderParse::Invalid;
            }
            masks[group.index()] = mask;
            offset += 2;
        }

        HeaderParse::Valid(Self { masks })
    }

    /// Append the header (without sync byte) to `out`
    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.group_byte());
        for group in self.groups() {
            out.extend_from_slice(&self.mask(group).to_le_bytes());
        }
    }
}
