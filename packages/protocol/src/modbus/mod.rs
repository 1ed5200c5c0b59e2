//! Modbus TCP request builders and response parsers on top of `rmodbus`.
//!
//! Every `generate_*` function returns the `ModbusRequest` alongside the raw
//! frame; keep the request around to validate the matching response.

mod get_bits;
mod get_words;
mod header;
mod set_single;

pub use get_bits::{generate_get_bits_request, parse_get_bits};
pub use get_words::{generate_get_words_request, parse_get_words};
pub use header::{parse_mbap_header, MBAP_HEADER_LEN};
pub use set_single::{generate_set_coil_request, generate_set_holding_request, parse_write_ack};

use rmodbus::ErrorKind;

use crate::error::CodecError;

pub const MODBUS_TCP_PORT: u16 = 502;
/// Largest word read issued in one request, keeping every response under 256 bytes.
pub const MAX_READ_WORDS: u16 = 120;
/// Offset of the first data byte in a read response (MBAP + function + byte count).
const DATA_OFFSET: usize = MBAP_HEADER_LEN + 3;

fn map_error(err: ErrorKind) -> CodecError {
    match err {
        ErrorKind::IllegalFunction
        | ErrorKind::IllegalDataAddress
        | ErrorKind::IllegalDataValue
        | ErrorKind::SlaveDeviceFailure => CodecError::Rejected(err.to_string()),
        other => CodecError::Malformed(other.to_string()),
    }
}

/// Data section of a read response, bounded by its byte count field.
fn read_payload(response: &[u8]) -> Result<&[u8], CodecError> {
    let declared = *response
        .get(DATA_OFFSET - 1)
        .ok_or_else(|| CodecError::Malformed("read response truncated".to_string()))?
        as usize;
    response
        .get(DATA_OFFSET..DATA_OFFSET + declared)
        .ok_or_else(|| {
            CodecError::Malformed(format!(
                "byte count {declared} exceeds frame of {} bytes",
                response.len()
            ))
        })
}
