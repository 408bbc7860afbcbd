//! Binary output configuration (registers 75, 76 and 77)

use super::fields::{FieldReader, FieldWriter};
use super::CodecError;
use crate::core::protocol::{BinaryHeader, OutputGroup};
use serde::{Deserialize, Serialize};

/// Ports a binary output is emitted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AsyncMode(pub u16);

impl AsyncMode {
    /// Output disabled
    pub const NONE: AsyncMode = AsyncMode(0);
    /// Serial port 1
    pub const SERIAL_1: AsyncMode = AsyncMode(1 << 0);
    /// Serial port 2
    pub const SERIAL_2: AsyncMode = AsyncMode(1 << 1);
    /// SPI
    pub const SPI: AsyncMode = AsyncMode(1 << 2);

    /// Whether every port in `other` is enabled
    pub fn contains(self, other: AsyncMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no port is enabled
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for AsyncMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Layout and rate of one binary output
///
/// The device does not describe its packets: this configuration is the only
/// way to know which fields a packet carries, so it has to match what was
/// last written to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BinaryOutputGroup {
    /// Ports the output is emitted on
    pub async_mode: AsyncMode,
    /// Output rate divisor relative to the IMU rate
    pub rate_divisor: u16,
    /// Field selection per group
    pub header: BinaryHeader,
}

impl BinaryOutputGroup {
    /// Output on `async_mode` at `rate_divisor` with no fields selected
    pub fn new(async_mode: AsyncMode, rate_divisor: u16) -> Self {
        Self {
            async_mode,
            rate_divisor,
            header: BinaryHeader::default(),
        }
    }

    /// Select fields of a group
    #[must_use]
    pub fn with_fields(mut self, group: OutputGroup, mask: u16) -> Self {
        self.header.masks[group.index()] |= mask;
        self
    }

    /// Whether packets with `header` were produced by this configuration
    pub fn matches(&self, header: &BinaryHeader) -> bool {
        !self.header.is_empty() && self.header == *header
    }

    fn validate(&self) -> Result<(), CodecError> {
        for group in self.header.groups() {
            let mask = self.header.mask(group);
            if !group.accepts_mask(mask) {
                return Err(CodecError::InvalidValue {
                    field: "group field mask",
                    value: format!("{group}={mask:#06X}"),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn write_fields(&self, w: &mut dyn FieldWriter) -> Result<(), CodecError> {
        self.validate()?;
        w.u16(self.async_mode.0);
        w.u16(self.rate_divisor);
        w.hex8(self.header.group_byte());
        for group in self.header.groups() {
            w.hex16(self.header.mask(group));
        }
        Ok(())
    }

    pub(crate) fn read_fields(r: &mut dyn FieldReader) -> Result<Self, CodecError> {
        let async_mode = AsyncMode(r.u16("async_mode")?);
        let rate_divisor = r.u16("rate_divisor")?;
        let groups = r.hex8("output_groups")?;
        if groups & 0xC0 != 0 {
            return Err(CodecError::InvalidValue {
                field: "output_groups",
                value: format!("{groups:X}"),
            });
        }

        let mut header = BinaryHeader::default();
        for group in OutputGroup::ALL {
            if groups & (1 << group.bit()) != 0 {
                header.masks[group.index()] = r.hex16("group field mask")?;
            }
        }

        let output = Self {
            async_mode,
            rate_divisor,
            header,
        };
        output.validate()?;
        Ok(output)
    }
}
