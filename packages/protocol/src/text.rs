use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// How a fixed-length text field is laid out in device memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextLayout {
    /// Raw characters padded with NUL/backspace up to the field length.
    #[default]
    Chars,
    /// Siemens `STRING[n]`: one byte max length, one byte current length, then data.
    S7String,
}

impl TextLayout {
    /// Number of bytes to fetch for a field holding `max_len` characters.
    pub fn byte_len(self, max_len: usize) -> usize {
        match self {
            TextLayout::Chars => max_len,
            TextLayout::S7String => max_len + 2,
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, CodecError> {
        match self {
            TextLayout::Chars => Ok(decode_text(bytes)),
            TextLayout::S7String => decode_s7_string(bytes),
        }
    }
}

/// Remove device padding from a string read out of a register block.
///
/// Firmware pads fixed-length fields with NUL and backspace bytes; every
/// control character is dropped and surrounding whitespace trimmed.
pub fn strip_padding(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Decode a raw byte field into a sanitized string.
pub fn decode_text(bytes: &[u8]) -> String {
    strip_padding(&String::from_utf8_lossy(bytes))
}

/// Decode a Siemens `STRING` (two byte header) into a sanitized string.
pub fn decode_s7_string(bytes: &[u8]) -> Result<String, CodecError> {
    if bytes.len() < 2 {
        return Err(CodecError::Malformed(format!(
            "S7 string needs a 2 byte header, got {} bytes",
            bytes.len()
        )));
    }
    let declared = bytes[1] as usize;
    let available = bytes.len() - 2;
    let len = declared.min(available).min(bytes[0] as usize);
    Ok(decode_text(&bytes[2..2 + len]))
}

/// Flatten 16-bit registers into bytes, high byte first unless `swap` is set.
pub fn words_to_bytes(words: &[u16], swap: bool) -> Vec<u8> {
    words
        .iter()
        .flat_map(|w| {
            let [hi, lo] = w.to_be_bytes();
            if swap {
                [lo, hi]
            } else {
                [hi, lo]
            }
        })
        .collect()
}
