use rmodbus::{guess_response_frame_len, ModbusProto};

use super::map_error;
use crate::error::CodecError;

/// Transaction id, protocol id, length.
pub const MBAP_HEADER_LEN: usize = 6;

/// Total frame length announced by an MBAP header.
pub fn parse_mbap_header(buf: [u8; MBAP_HEADER_LEN]) -> Result<usize, CodecError> {
    if buf[2] != 0 || buf[3] != 0 {
        return Err(CodecError::Malformed(format!(
            "unexpected protocol id {:02x}{:02x}",
            buf[2], buf[3]
        )));
    }
    let len = guess_response_frame_len(&buf, ModbusProto::TcpUdp).map_err(map_error)? as usize;
    if len <= MBAP_HEADER_LEN {
        return Err(CodecError::Malformed(format!("frame length {len} too short")));
    }
    Ok(len)
}
