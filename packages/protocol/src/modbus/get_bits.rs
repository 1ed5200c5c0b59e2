use rmodbus::{client::ModbusRequest, ModbusProto};

use super::{map_error, read_payload};
use crate::{address::ModbusTable, error::CodecError};

/// Read `count` coils (0x01) or discrete inputs (0x02).
pub fn generate_get_bits_request(
    unit_id: u8,
    table: ModbusTable,
    start: u16,
    count: u16,
) -> Result<(ModbusRequest, Vec<u8>), CodecError> {
    let mut request = ModbusRequest::new(unit_id, ModbusProto::TcpUdp);
    let mut raw = Vec::with_capacity(12);
    match table {
        ModbusTable::Coil => request.generate_get_coils(start, count, &mut raw),
        ModbusTable::Discrete => request.generate_get_discretes(start, count, &mut raw),
        other => {
            return Err(CodecError::Invalid(format!(
                "{other} table does not hold single bits"
            )))
        }
    }
    .map_err(map_error)?;
    Ok((request, raw))
}

pub fn parse_get_bits(
    request: &ModbusRequest,
    response: &[u8],
    count: u16,
) -> Result<Vec<bool>, CodecError> {
    request.parse_ok(response).map_err(map_error)?;

    // First bit is the LSB of the first data byte.
    let mut values = read_payload(response)?
        .iter()
        .flat_map(|byte| (0..8).map(move |i| byte & (1 << i) != 0))
        .collect::<Vec<bool>>();
    if values.len() < count as usize {
        return Err(CodecError::Malformed(format!(
            "expected {count} bits, got {}",
            values.len()
        )));
    }
    values.truncate(count as usize);
    log::trace!("Received bits: {values:?}");

    Ok(values)
}
