//! Wire-level building blocks shared by the stationlink transports.
//!
//! Everything in this crate is pure: frames are built into byte vectors and
//! parsed from byte slices, socket handling lives in the main crate.

pub mod address;
pub mod error;
pub mod modbus;
pub mod s7;
pub mod text;

pub use address::{
    ModbusAddress, ModbusTable, Protocol, RegisterAddress, S7Address, S7_MAX_BYTE,
};
pub use error::{AddressError, CodecError};
pub use text::{decode_s7_string, decode_text, strip_padding, words_to_bytes, TextLayout};
