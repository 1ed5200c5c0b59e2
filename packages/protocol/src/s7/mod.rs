//! Siemens S7 over ISO-on-TCP (RFC 1006).
//!
//! Frame layout shared by every telegram:
//!
//! ```text
//! TPKT  [0x03, 0x00, len_hi, len_lo]
//! COTP  [0x02, 0xF0, 0x80]            (data transfer, last unit)
//! S7    [0x32, rosctr, ...]
//! ```
//!
//! Only the pieces needed for single-item DB reads and writes are modelled.

mod read_var;
mod setup;
mod write_var;

pub use read_var::{build_read_var, parse_read_var};
pub use setup::{
    build_connection_request, build_setup_communication, check_connection_confirm,
    parse_setup_communication, remote_tsap, CONNECTION_TYPE_PG, LOCAL_TSAP,
};
pub use write_var::{build_write_var, parse_write_var};

use crate::{address::S7_MAX_BYTE, error::CodecError};

pub const ISO_TCP_PORT: u16 = 102;
/// PDU length requested during setup; the CPU may answer with less.
pub const REQUESTED_PDU_LEN: u16 = 480;
/// Bytes of TPKT + COTP data header preceding every S7 PDU.
pub const TPKT_COTP_LEN: usize = 7;
/// Overhead of a read-var response around its payload.
pub const READ_RESPONSE_OVERHEAD: usize = 18;

const TPKT_VERSION: u8 = 0x03;
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FUNC_READ_VAR: u8 = 0x04;
const FUNC_WRITE_VAR: u8 = 0x05;

const RETURN_SUCCESS: u8 = 0xFF;
const RETURN_INVALID_ADDRESS: u8 = 0x05;
const RETURN_NOT_FOUND: u8 = 0x0A;
const RETURN_TYPE_MISMATCH: u8 = 0x07;

/// Memory area code for data blocks.
pub const AREA_DB: u8 = 0x84;

/// Element size of one read/write item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSize {
    Bit,
    Byte,
}

impl ItemSize {
    fn word_len(self) -> u8 {
        match self {
            ItemSize::Bit => 0x01,
            ItemSize::Byte => 0x02,
        }
    }

    fn data_transport(self) -> u8 {
        match self {
            ItemSize::Bit => 0x03,
            ItemSize::Byte => 0x04,
        }
    }
}

/// Highest start address an item can carry, in bits.
const MAX_START_BIT: u32 = S7_MAX_BYTE * 8 + 7;

/// One variable specification inside a read/write job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSpec {
    pub area: u8,
    pub db: u16,
    /// Start address in bits (`byte * 8 + bit`), at most 24 bits wide.
    pub start_bit: u32,
    pub size: ItemSize,
    /// Number of elements; always 1 for bit access.
    pub count: u16,
}

impl VarSpec {
    /// `None` when `start_bit` does not fit the item address.
    pub fn bit(db: u16, start_bit: u32) -> Option<Self> {
        (start_bit <= MAX_START_BIT).then_some(Self {
            area: AREA_DB,
            db,
            start_bit,
            size: ItemSize::Bit,
            count: 1,
        })
    }

    /// `None` when `byte` lies beyond [`S7_MAX_BYTE`].
    pub fn bytes(db: u16, byte: u32, count: u16) -> Option<Self> {
        if byte > S7_MAX_BYTE {
            return None;
        }
        Some(Self {
            area: AREA_DB,
            db,
            start_bit: byte.checked_mul(8)?,
            size: ItemSize::Byte,
            count,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let [_, a2, a1, a0] = self.start_bit.to_be_bytes();
        out.extend_from_slice(&[0x12, 0x0A, 0x10, self.size.word_len()]);
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.db.to_be_bytes());
        out.extend_from_slice(&[self.area, a2, a1, a0]);
    }
}

/// Length of the rest of a telegram given its 4 byte TPKT header.
pub fn tpkt_remaining_len(header: &[u8]) -> Result<usize, CodecError> {
    if header.len() < 4 || header[0] != TPKT_VERSION {
        return Err(CodecError::Malformed(format!(
            "invalid TPKT header {header:02x?}"
        )));
    }
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total <= 4 {
        return Err(CodecError::Malformed(format!("TPKT length {total} too short")));
    }
    Ok(total - 4)
}

fn wrap_tpkt(pdu: &[u8]) -> Vec<u8> {
    let total = (pdu.len() + TPKT_COTP_LEN) as u16;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&[TPKT_VERSION, 0x00]);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&[0x02, 0xF0, 0x80]);
    out.extend_from_slice(pdu);
    out
}

fn job_header(pdu_ref: u16, param_len: u16, data_len: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    out.extend_from_slice(&pdu_ref.to_be_bytes());
    out.extend_from_slice(&param_len.to_be_bytes());
    out.extend_from_slice(&data_len.to_be_bytes());
    out
}

/// Validate the TPKT/COTP/S7 ack header of a response and return the
/// parameter + data section that follows it.
fn check_ack(frame: &[u8], pdu_ref: u16, function: u8) -> Result<&[u8], CodecError> {
    // 7 bytes TPKT/COTP + 12 bytes ack header + function + item count
    if frame.len() < TPKT_COTP_LEN + 14 {
        return Err(CodecError::Malformed(format!(
            "S7 response too short ({} bytes)",
            frame.len()
        )));
    }
    if frame[0] != TPKT_VERSION || frame[5] != 0xF0 {
        return Err(CodecError::Malformed("invalid ISO header".to_string()));
    }
    let s7 = &frame[TPKT_COTP_LEN..];
    if s7[0] != S7_PROTOCOL_ID || s7[1] != ROSCTR_ACK_DATA {
        return Err(CodecError::Malformed(format!(
            "unexpected S7 header {:02x} {:02x}",
            s7[0], s7[1]
        )));
    }
    let echoed = u16::from_be_bytes([s7[4], s7[5]]);
    if echoed != pdu_ref {
        return Err(CodecError::Malformed(format!(
            "PDU reference mismatch: sent {pdu_ref}, got {echoed}"
        )));
    }
    let (class, code) = (s7[10], s7[11]);
    if class != 0 || code != 0 {
        return Err(CodecError::Rejected(format!(
            "S7 error class 0x{class:02x} code 0x{code:02x}"
        )));
    }
    if s7[12] != function {
        return Err(CodecError::Malformed(format!(
            "expected function 0x{function:02x}, got 0x{:02x}",
            s7[12]
        )));
    }
    Ok(&s7[12..])
}

fn check_return_code(code: u8) -> Result<(), CodecError> {
    match code {
        RETURN_SUCCESS => Ok(()),
        RETURN_INVALID_ADDRESS => Err(CodecError::Rejected(
            "invalid address (out of range or optimized DB)".to_string(),
        )),
        RETURN_NOT_FOUND => Err(CodecError::Rejected("object does not exist".to_string())),
        RETURN_TYPE_MISMATCH => Err(CodecError::Rejected("data type mismatch".to_string())),
        other => Err(CodecError::Rejected(format!("item return code 0x{other:02x}"))),
    }
}
