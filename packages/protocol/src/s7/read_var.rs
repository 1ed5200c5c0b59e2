use super::{check_ack, check_return_code, job_header, wrap_tpkt, VarSpec, FUNC_READ_VAR};
use crate::error::CodecError;

/// Single-item `Read Var` job.
pub fn build_read_var(pdu_ref: u16, spec: &VarSpec) -> Vec<u8> {
    let mut pdu = job_header(pdu_ref, 14, 0);
    pdu.extend_from_slice(&[FUNC_READ_VAR, 0x01]);
    spec.encode(&mut pdu);
    wrap_tpkt(&pdu)
}

/// Payload bytes of a single-item `Read Var` response.
pub fn parse_read_var(frame: &[u8], pdu_ref: u16) -> Result<Vec<u8>, CodecError> {
    let body = check_ack(frame, pdu_ref, FUNC_READ_VAR)?;
    if body.len() < 3 {
        return Err(CodecError::Malformed("read response has no item".to_string()));
    }
    check_return_code(body[2])?;
    if body.len() < 6 {
        return Err(CodecError::Malformed("read item header truncated".to_string()));
    }

    let transport = body[3];
    let raw_len = u16::from_be_bytes([body[4], body[5]]) as usize;
    // Length is reported in bits for bit/byte transports, in bytes otherwise.
    let len = match transport {
        0x03 => raw_len.div_ceil(8),
        0x04 | 0x05 => raw_len / 8,
        _ => raw_len,
    };
    let data = &body[6..];
    if data.len() < len {
        return Err(CodecError::Malformed(format!(
            "read item declares {len} bytes, frame carries {}",
            data.len()
        )));
    }
    Ok(data[..len].to_vec())
}
