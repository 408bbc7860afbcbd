//! Field readers and writers
//!
//! Registers describe their fields once against [`FieldWriter`] and
//! [`FieldReader`]; the ASCII and packed encodings are just two
//! implementations of those traits.

use super::CodecError;
use bytes::{Buf, BufMut};

/// Sink for register fields in protocol order
pub trait FieldWriter {
    /// Unsigned 8-bit integer
    fn u8(&mut self, v: u8);
    /// Unsigned 16-bit integer
    fn u16(&mut self, v: u16);
    /// Unsigned 32-bit integer
    fn u32(&mut self, v: u32);
    /// Single-precision float
    fn f32(&mut self, v: f32);
    /// 8-bit bitfield
    fn hex8(&mut self, v: u8);
    /// 16-bit bitfield
    fn hex16(&mut self, v: u16);
    /// Fixed-point value with `decimals` decimal places
    fn fixed(&mut self, v: f32, decimals: u32);
    /// Free text
    fn string(&mut self, v: &str);
}

/// Source of register fields in protocol order
pub trait FieldReader {
    /// Unsigned 8-bit integer
    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError>;
    /// Unsigned 16-bit integer
    fn u16(&mut self, field: &'static str) -> Result<u16, CodecError>;
    /// Unsigned 32-bit integer
    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError>;
    /// Single-precision float
    fn f32(&mut self, field: &'static str) -> Result<f32, CodecError>;
    /// 8-bit bitfield
    fn hex8(&mut self, field: &'static str) -> Result<u8, CodecError>;
    /// 16-bit bitfield
    fn hex16(&mut self, field: &'static str) -> Result<u16, CodecError>;
    /// Fixed-point value with `decimals` decimal places
    fn fixed(&mut self, field: &'static str, decimals: u32) -> Result<f32, CodecError>;
    /// Free text
    fn string(&mut self, field: &'static str) -> Result<String, CodecError>;
    /// Whether every field has been consumed
    fn is_exhausted(&self) -> bool;
}

/// Raw integer carried on the wire for a fixed-point value
pub fn fixed_raw(v: f32, decimals: u32) -> i32 {
    let scale = 10f64.powi(decimals as i32);
    (f64::from(v) * scale).round() as i32
}

/// Value represented by a raw fixed-point integer
pub fn fixed_value(raw: i32, decimals: u32) -> f32 {
    let scale = 10f64.powi(decimals as i32);
    (f64::from(raw) / scale) as f32
}

fn format_fixed(raw: i32, decimals: u32) -> String {
    if decimals == 0 {
        return raw.to_string();
    }
    let scale = 10i64.pow(decimals);
    let raw = i64::from(raw);
    let sign = if raw < 0 { "-" } else { "" };
    let abs = raw.abs();
    format!(
        "{sign}{}.{:0width$}",
        abs / scale,
        abs % scale,
        width = decimals as usize
    )
}

/// Comma-separated ASCII tokens
#[derive(Debug, Default)]
pub struct AsciiWriter {
    tokens: Vec<String>,
}

impl AsciiWriter {
    /// Empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens written so far
    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }
}

impl FieldWriter for AsciiWriter {
    fn u8(&mut self, v: u8) {
        self.tokens.push(v.to_string());
    }

    fn u16(&mut self, v: u16) {
        self.tokens.push(v.to_string());
    }

    fn u32(&mut self, v: u32) {
        self.tokens.push(v.to_string());
    }

    fn f32(&mut self, v: f32) {
        // Display is the shortest representation that parses back to the same value.
        self.tokens.push(v.to_string());
    }

    fn hex8(&mut self, v: u8) {
        self.tokens.push(format!("{v:X}"));
    }

    fn hex16(&mut self, v: u16) {
        self.tokens.push(format!("{v:X}"));
    }

    fn fixed(&mut self, v: f32, decimals: u32) {
        self.tokens.push(format_fixed(fixed_raw(v, decimals), decimals));
    }

    fn string(&mut self, v: &str) {
        self.tokens.push(v.to_string());
    }
}

/// Reader over the tokens of a response sentence
pub struct AsciiReader<'a> {
    tokens: &'a [String],
    position: usize,
}

impl<'a> AsciiReader<'a> {
    /// Read from `tokens`
    pub fn new(tokens: &'a [String]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn next(&mut self) -> Result<&'a str, CodecError> {
        let token = self.tokens.get(self.position).ok_or(CodecError::FieldCount {
            expected: self.position + 1,
            found: self.tokens.len(),
        })?;
        self.position += 1;
        Ok(token.trim())
    }

    fn parse<T: std::str::FromStr>(&mut self, field: &'static str) -> Result<T, CodecError> {
        let token = self.next()?;
        token.parse().map_err(|_| CodecError::Parse {
            field,
            value: token.to_string(),
        })
    }

    fn parse_hex(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let token = self.next()?;
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        u32::from_str_radix(digits, 16).map_err(|_| CodecError::Parse {
            field,
            value: token.to_string(),
        })
    }
}

impl FieldReader for AsciiReader<'_> {
    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        self.parse(field)
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        self.parse(field)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        self.parse(field)
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, CodecError> {
        self.parse(field)
    }

    fn hex8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        let v = self.parse_hex(field)?;
        u8::try_from(v).map_err(|_| CodecError::InvalidValue {
            field,
            value: format!("{v:X}"),
        })
    }

    fn hex16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        let v = self.parse_hex(field)?;
        u16::try_from(v).map_err(|_| CodecError::InvalidValue {
            field,
            value: format!("{v:X}"),
        })
    }

    fn fixed(&mut self, field: &'static str, decimals: u32) -> Result<f32, CodecError> {
        let v: f64 = self.parse(field)?;
        let raw = (v * 10f64.powi(decimals as i32)).round();
        if raw < f64::from(i32::MIN) || raw > f64::from(i32::MAX) {
            return Err(CodecError::InvalidValue {
                field,
                value: v.to_string(),
            });
        }
        Ok(fixed_value(raw as i32, decimals))
    }

    fn string(&mut self, _field: &'static str) -> Result<String, CodecError> {
        self.next().map(str::to_string)
    }

    fn is_exhausted(&self) -> bool {
        self.position >= self.tokens.len()
    }
}

/// Packed little-endian fields
#[derive(Debug, Default)]
pub struct PackedWriter {
    bytes: Vec<u8>,
}

impl PackedWriter {
    /// Empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl FieldWriter for PackedWriter {
    fn u8(&mut self, v: u8) {
        self.bytes.put_u8(v);
    }

    fn u16(&mut self, v: u16) {
        self.bytes.put_u16_le(v);
    }

    fn u32(&mut self, v: u32) {
        self.bytes.put_u32_le(v);
    }

    fn f32(&mut self, v: f32) {
        self.bytes.put_f32_le(v);
    }

    fn hex8(&mut self, v: u8) {
        self.bytes.put_u8(v);
    }

    fn hex16(&mut self, v: u16) {
        self.bytes.put_u16_le(v);
    }

    fn fixed(&mut self, v: f32, decimals: u32) {
        self.bytes.put_i32_le(fixed_raw(v, decimals));
    }

    fn string(&mut self, v: &str) {
        let bytes = v.as_bytes();
        let len = bytes.len().min(usize::from(u8::MAX));
        self.bytes.put_u8(len as u8);
        self.bytes.put_slice(&bytes[..len]);
    }
}

/// Reader over a packed register body
pub struct PackedReader<'a> {
    buf: &'a [u8],
}

impl<'a> PackedReader<'a> {
    /// Read from `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            Err(CodecError::Truncated)
        } else {
            Ok(())
        }
    }
}

impl FieldReader for PackedReader<'_> {
    fn u8(&mut self, _field: &'static str) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, _field: &'static str) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, _field: &'static str) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn f32(&mut self, _field: &'static str) -> Result<f32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    fn hex8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        self.u8(field)
    }

    fn hex16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        self.u16(field)
    }

    fn fixed(&mut self, _field: &'static str, decimals: u32) -> Result<f32, CodecError> {
        self.need(4)?;
        Ok(fixed_value(self.buf.get_i32_le(), decimals))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = usize::from(self.u8(field)?);
        self.need(len)?;
        let text = std::str::from_utf8(&self.buf[..len]).map_err(|_| CodecError::Parse {
            field,
            value: hex::encode(&self.buf[..len]),
        })?;
        let text = text.to_string();
        self.buf.advance(len);
        Ok(text)
    }

    fn is_exhausted(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_formatting() {
        assert_eq!(format_fixed(2550, 2), "25.50");
        assert_eq!(format_fixed(-5, 3), "-0.005");
        assert_eq!(format_fixed(101_325, 3), "101.325");
        assert_eq!(format_fixed(7, 0), "7");
    }

    #[test]
    fn test_fixed_point_ascii_round_trip() {
        let mut w = AsciiWriter::new();
        w.fixed(25.5, 2);
        w.fixed(-0.005, 3);
        let tokens = w.into_tokens();
        let mut r = AsciiReader::new(&tokens);
        assert_eq!(r.fixed("a", 2).unwrap(), 25.5);
        assert_eq!(fixed_raw(r.fixed("b", 3).unwrap(), 3), -5);
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_hex_tokens() {
        let tokens = vec!["1F".to_string(), "0x0029".to_string(), "1FF".to_string()];
        let mut r = AsciiReader::new(&tokens);
        assert_eq!(r.hex8("a").unwrap(), 0x1F);
        assert_eq!(r.hex16("b").unwrap(), 0x29);
        assert!(matches!(r.hex8("c"), Err(CodecError::InvalidValue { .. })));
    }

    #[test]
    fn test_packed_truncation() {
        let mut r = PackedReader::new(&[0x01, 0x02]);
        assert!(matches!(r.u32("x"), Err(CodecError::Truncated)));
        assert_eq!(r.u16("y").unwrap(), 0x0201);
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_packed_string() {
        let mut w = PackedWriter::new();
        w.string("VN-100");
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 6);
        let mut r = PackedReader::new(&bytes);
        assert_eq!(r.string("model").unwrap(), "VN-100");
    }
}
