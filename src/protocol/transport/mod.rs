//! Blocking register transports for the supported PLC protocols.
//!
//! A transport owns at most one socket. Any I/O failure drops the socket so
//! the next call starts from a fresh connection.

mod modbus;
mod s7;

pub use modbus::ModbusTransport;
pub use s7::S7Transport;

use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};
use thiserror::Error;

use stationlink_protocol::{CodecError, RegisterAddress, TextLayout};

use crate::cli::config::{LinkConfig, LinkProtocol};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("device rejected request: {0}")]
    Device(String),
    #[error("address {address} not usable here: {reason}")]
    Address { address: String, reason: String },
    #[error("reconnect backing off for another {0:?}")]
    Backoff(Duration),
    #[error("link closed")]
    Closed,
}

impl TransportError {
    pub fn address(address: &RegisterAddress, reason: impl Into<String>) -> Self {
        Self::Address {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the socket can no longer be trusted after this error.
    pub fn breaks_link(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout(_) | Self::Io(_) | Self::Malformed(_)
        )
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(msg) => Self::Malformed(msg),
            CodecError::Rejected(msg) => Self::Device(msg),
            CodecError::Invalid(msg) => Self::Address {
                address: "-".to_string(),
                reason: msg,
            },
        }
    }
}

/// Uniform typed access to one PLC.
///
/// Every call is a blocking round trip bounded by the link's I/O timeout.
pub trait RegisterTransport: Send {
    fn connect(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn read_bool(&mut self, address: &RegisterAddress) -> Result<bool, TransportError>;

    /// Read a text field and strip its padding.
    fn read_string(
        &mut self,
        address: &RegisterAddress,
        max_len: usize,
        layout: TextLayout,
    ) -> Result<String, TransportError>;

    fn write_bool(&mut self, address: &RegisterAddress, value: bool) -> Result<(), TransportError>;
}

/// Builds the transport behind a configured link.
pub trait TransportFactory: Send + Sync {
    fn create(&self, link: &LinkConfig) -> Box<dyn RegisterTransport>;
}

/// Factory producing real socket transports.
pub struct WireTransportFactory;

impl TransportFactory for WireTransportFactory {
    fn create(&self, link: &LinkConfig) -> Box<dyn RegisterTransport> {
        match link.protocol {
            LinkProtocol::S7 { rack, slot } => Box::new(S7Transport::new(
                link.endpoint(),
                rack,
                slot,
                link.connect_timeout(),
                link.io_timeout(),
            )),
            LinkProtocol::Modbus {
                unit_id,
                swap_bytes,
            } => Box::new(ModbusTransport::new(
                link.endpoint(),
                unit_id,
                swap_bytes,
                link.connect_timeout(),
                link.io_timeout(),
            )),
        }
    }
}

fn io_error(err: io::Error, timeout: Duration) -> TransportError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout(timeout),
        _ => TransportError::Io(err),
    }
}

/// Open a TCP connection trying every resolved address in turn.
fn open_stream(
    endpoint: &str,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let connect_error = |source: io::Error| TransportError::Connect {
        endpoint: endpoint.to_string(),
        source,
    };
    let mut last_error = None;
    for addr in endpoint.to_socket_addrs().map_err(connect_error)? {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(io_timeout))?;
                stream.set_write_timeout(Some(io_timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_error = Some(err),
        }
    }
    Err(connect_error(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no address resolved")
    })))
}

/// Send one request frame and read back a response whose total length is
/// announced by its first `header_len` bytes.
fn round_trip(
    stream: &mut TcpStream,
    request: &[u8],
    header_len: usize,
    timeout: Duration,
    body_len: impl FnOnce(&[u8]) -> Result<usize, CodecError>,
) -> Result<Vec<u8>, TransportError> {
    let io = |err: io::Error| io_error(err, timeout);
    stream.write_all(request).map_err(io)?;
    let mut frame = vec![0u8; header_len];
    stream.read_exact(&mut frame).map_err(io)?;
    let rest = body_len(&frame)?;
    frame.resize(header_len + rest, 0);
    stream.read_exact(&mut frame[header_len..]).map_err(io)?;
    Ok(frame)
}
