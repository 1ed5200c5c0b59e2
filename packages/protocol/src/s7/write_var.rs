use super::{
    check_ack, check_return_code, job_header, wrap_tpkt, ItemSize, VarSpec, FUNC_WRITE_VAR,
};
use crate::error::CodecError;

/// Single-item `Write Var` job carrying `data`.
///
/// Bit items must carry exactly one byte (0 or 1).
pub fn build_write_var(pdu_ref: u16, spec: &VarSpec, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let bit_len = match spec.size {
        ItemSize::Bit if data.len() != 1 => {
            return Err(CodecError::Invalid(format!(
                "bit write needs exactly one byte, got {}",
                data.len()
            )))
        }
        ItemSize::Bit => 1u16,
        ItemSize::Byte => u16::try_from(data.len() * 8)
            .map_err(|_| CodecError::Invalid(format!("{} bytes is too long", data.len())))?,
    };

    let data_len = (4 + data.len()) as u16;
    let mut pdu = job_header(pdu_ref, 14, data_len);
    pdu.extend_from_slice(&[FUNC_WRITE_VAR, 0x01]);
    spec.encode(&mut pdu);
    pdu.extend_from_slice(&[0x00, spec.size.data_transport()]);
    pdu.extend_from_slice(&bit_len.to_be_bytes());
    pdu.extend_from_slice(data);
    Ok(wrap_tpkt(&pdu))
}

/// Check the item return code of a `Write Var` acknowledgement.
pub fn parse_write_var(frame: &[u8], pdu_ref: u16) -> Result<(), CodecError> {
    let body = check_ack(frame, pdu_ref, FUNC_WRITE_VAR)?;
    match body.get(2) {
        Some(code) => check_return_code(*code),
        None => Err(CodecError::Malformed("write response has no item".to_string())),
    }
}
