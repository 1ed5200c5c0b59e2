use thiserror::Error;

/// Failure to parse a textual register address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty register address")]
    Empty,
    #[error("unrecognised register address '{0}'")]
    Syntax(String),
    #[error("bit offset {bit} out of range in '{address}' (max {max})")]
    BitRange { address: String, bit: u8, max: u8 },
    #[error("byte offset {byte} out of range in '{address}' (max {max})")]
    ByteRange { address: String, byte: u32, max: u32 },
    #[error("unknown modbus table '{0}'")]
    UnknownTable(String),
    #[error("table '{0}' does not support bit offsets")]
    BitNotAllowed(String),
}

/// Failure while building or decoding a protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("device rejected request: {0}")]
    Rejected(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}
