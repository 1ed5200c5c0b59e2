use rmodbus::{client::ModbusRequest, ModbusProto};

use super::map_error;
use crate::error::CodecError;

/// Write a single coil (0x05).
pub fn generate_set_coil_request(
    unit_id: u8,
    register: u16,
    value: bool,
) -> Result<(ModbusRequest, Vec<u8>), CodecError> {
    let mut request = ModbusRequest::new(unit_id, ModbusProto::TcpUdp);
    let mut raw = Vec::with_capacity(12);
    request
        .generate_set_coil(register, value, &mut raw)
        .map_err(map_error)?;
    Ok((request, raw))
}

/// Write a single holding register (0x06).
pub fn generate_set_holding_request(
    unit_id: u8,
    register: u16,
    value: u16,
) -> Result<(ModbusRequest, Vec<u8>), CodecError> {
    let mut request = ModbusRequest::new(unit_id, ModbusProto::TcpUdp);
    let mut raw = Vec::with_capacity(12);
    request
        .generate_set_holding(register, value, &mut raw)
        .map_err(map_error)?;
    Ok((request, raw))
}

/// Validate the echo returned for a single write.
pub fn parse_write_ack(request: &ModbusRequest, response: &[u8]) -> Result<(), CodecError> {
    request.parse_ok(response).map_err(map_error)
}
