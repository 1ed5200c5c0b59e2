//! Stationlink: a station handshake engine for production lines
//!
//! Each configured station is polled over a shared S7 or Modbus TCP link.
//! When the PLC raises its Request bit the engine reads the unit's serial and
//! measurements, optionally consults MES, writes an Ok or Ng verdict and then
//! raises Response. When Request drops the verdict bits are cleared again.
//!
//! Wire codecs live in the `stationlink_protocol` package; this crate adds
//! transports, the handshake engine, the polling scheduler and the CLI.

pub mod api;
#[doc(hidden)]
pub mod boot;
pub mod cli;
pub mod core;
pub mod protocol;

pub use api::*;
