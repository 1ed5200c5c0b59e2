use rmodbus::{client::ModbusRequest, ModbusProto};

use super::{map_error, read_payload, MAX_READ_WORDS};
use crate::{address::ModbusTable, error::CodecError};

/// Read `count` holding (0x03) or input (0x04) registers.
pub fn generate_get_words_request(
    unit_id: u8,
    table: ModbusTable,
    start: u16,
    count: u16,
) -> Result<(ModbusRequest, Vec<u8>), CodecError> {
    if count == 0 || count > MAX_READ_WORDS {
        return Err(CodecError::Invalid(format!(
            "register count {count} outside 1..={MAX_READ_WORDS}"
        )));
    }
    let mut request = ModbusRequest::new(unit_id, ModbusProto::TcpUdp);
    let mut raw = Vec::with_capacity(12);
    match table {
        ModbusTable::Holding => request.generate_get_holdings(start, count, &mut raw),
        ModbusTable::Input => request.generate_get_inputs(start, count, &mut raw),
        other => {
            return Err(CodecError::Invalid(format!(
                "{other} table does not hold registers"
            )))
        }
    }
    .map_err(map_error)?;
    Ok((request, raw))
}

pub fn parse_get_words(
    request: &ModbusRequest,
    response: &[u8],
    count: u16,
) -> Result<Vec<u16>, CodecError> {
    request.parse_ok(response).map_err(map_error)?;

    let values = read_payload(response)?
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect::<Vec<_>>();
    if values.len() < count as usize {
        return Err(CodecError::Malformed(format!(
            "expected {count} registers, got {}",
            values.len()
        )));
    }
    log::trace!("Received registers: {values:?}");

    Ok(values)
}
