//! ASCII sentence layer
//!
//! Sentences look like `$VNRRG,05,115200,1*5A\r\n`: a `$` lead, a header made
//! of the `VN` talker prefix and a keyword, comma-separated fields, a checksum
//! after `*` and a line terminator.

use super::checksum::ChecksumMode;
use super::FrameError;

/// Talker prefix carried by every sentence header
pub const TALKER: &str = "VN";

/// A decoded ASCII sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiSentence {
    /// Full header, e.g. `VNRRG`
    pub header: String,
    /// Fields after the header, without the checksum
    pub fields: Vec<String>,
}

impl AsciiSentence {
    /// Create a sentence from a keyword (without the talker prefix) and fields
    pub fn new<I, S>(keyword: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: format!("{TALKER}{keyword}"),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse the bytes of a frame already validated by the decoder
    ///
    /// Accepts the frame with or without its checksum and terminator.
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(raw).map_err(|_| FrameError::NotAscii)?;
        let text = text.trim_end_matches(['\r', '\n']);
        let body = text.strip_prefix('$').ok_or(FrameError::MissingLead)?;
        let body = match body.rfind('*') {
            Some(star) => &body[..star],
            None => body,
        };

        let mut parts = body.split(',');
        let header = parts.next().unwrap_or_default();
        if header.is_empty() {
            return Err(FrameError::EmptyHeader);
        }

        Ok(Self {
            header: header.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }

    /// Keyword with the talker prefix stripped, e.g. `RRG`
    pub fn keyword(&self) -> &str {
        self.header.strip_prefix(TALKER).unwrap_or(&self.header)
    }

    /// Field by index
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Body between `$` and `*`
    pub fn body(&self) -> String {
        let mut body = self.header.clone();
        for field in &self.fields {
            body.push(',');
            body.push_str(field);
        }
        body
    }

    /// Serialize with checksum and `\r\n`
    pub fn to_bytes(&self, mode: ChecksumMode) -> Vec<u8> {
        build_sentence(&self.body(), mode)
    }
}

/// Wrap a sentence body (`VNRRG,5`) with lead, checksum and terminator
pub fn build_sentence(body: &str, mode: ChecksumMode) -> Vec<u8> {
    let checksum = mode.format(mode.compute(body.as_bytes()));
    let mut out = Vec::with_capacity(body.len() + mode.hex_digits() + 4);
    out.push(b'$');
    out.extend_from_slice(body.as_bytes());
    out.push(b'*');
    out.extend_from_slice(checksum.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

/// Verify the checksum of a complete candidate (`$...*CS`, terminator stripped)
///
/// Returns the checksum value carried by the sentence when it matches.
pub fn verify_sentence(candidate: &[u8]) -> Result<u16, FrameError> {
    if candidate.first() != Some(&b'$') {
        return Err(FrameError::MissingLead);
    }
    let star = candidate
        .iter()
        .rposition(|&b| b == b'*')
        .ok_or(FrameError::MissingChecksum)?;
    let digits = &candidate[star + 1..];
    let mode = ChecksumMode::from_hex_digits(digits.len()).ok_or(FrameError::MissingChecksum)?;
    let text = std::str::from_utf8(digits).map_err(|_| FrameError::NotAscii)?;
    let expected = u16::from_str_radix(text, 16).map_err(|_| FrameError::MissingChecksum)?;
    let computed = mode.compute(&candidate[1..star]);

    if computed == expected {
        Ok(computed)
    } else {
        Err(FrameError::ChecksumMismatch { expected, computed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_verify_crc16() {
        let bytes = build_sentence("VNRRG,5", ChecksumMode::Crc16);
        assert!(bytes.starts_with(b"$VNRRG,5*"));
        assert!(bytes.ends_with(b"\r\n"));
        let candidate = &bytes[..bytes.len() - 2];
        assert!(verify_sentence(candidate).is_ok());
    }

    #[test]
    fn test_verify_xor8() {
        let bytes = build_sentence("VNYPR,+010.071,-000.278,-000.836", ChecksumMode::Xor8);
        let candidate = &bytes[..bytes.len() - 2];
        assert_eq!(candidate[candidate.len() - 3], b'*');
        assert!(verify_sentence(candidate).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_checksum() {
        let result = verify_sentence(b"$VNRRG,5*0000");
        assert!(matches!(result, Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_parse_fields() {
        let sentence = AsciiSentence::parse(b"$VNRRG,05,115200,1*ABCD\r\n").unwrap();
        assert_eq!(sentence.header, "VNRRG");
        assert_eq!(sentence.keyword(), "RRG");
        assert_eq!(sentence.fields, vec!["05", "115200", "1"]);
    }

    #[test]
    fn test_new_and_body() {
        let sentence = AsciiSentence::new("WRG", ["5", "9600"]);
        assert_eq!(sentence.body(), "VNWRG,5,9600");
    }
}
