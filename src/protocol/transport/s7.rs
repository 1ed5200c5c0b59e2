use std::{net::TcpStream, time::Duration};

use stationlink_protocol::{
    s7::{
        build_connection_request, build_read_var, build_setup_communication, build_write_var,
        check_connection_confirm, parse_read_var, parse_setup_communication, parse_write_var,
        remote_tsap, tpkt_remaining_len, VarSpec, CONNECTION_TYPE_PG, LOCAL_TSAP,
        READ_RESPONSE_OVERHEAD, REQUESTED_PDU_LEN,
    },
    CodecError, RegisterAddress, S7Address, TextLayout,
};

use super::{open_stream, round_trip, RegisterTransport, TransportError};

/// Siemens S7 over ISO-on-TCP.
pub struct S7Transport {
    endpoint: String,
    rack: u16,
    slot: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<TcpStream>,
    pdu_len: u16,
    pdu_ref: u16,
}

impl S7Transport {
    pub fn new(
        endpoint: String,
        rack: u16,
        slot: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            rack,
            slot,
            connect_timeout,
            io_timeout,
            stream: None,
            pdu_len: REQUESTED_PDU_LEN,
            pdu_ref: 0,
        }
    }

    /// PDU length negotiated with the CPU.
    pub fn pdu_len(&self) -> u16 {
        self.pdu_len
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1).max(1);
        self.pdu_ref
    }

    fn drop_stream(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("Dropped S7 socket to {}", self.endpoint);
        }
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let timeout = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let result = round_trip(stream, request, 4, timeout, tpkt_remaining_len);
        if result.is_err() {
            self.drop_stream();
        }
        result
    }

    fn checked<T>(&mut self, parsed: Result<T, CodecError>) -> Result<T, TransportError> {
        let result = parsed.map_err(TransportError::from);
        if result.as_ref().is_err_and(|e| e.breaks_link()) {
            self.drop_stream();
        }
        result
    }

    fn negotiate(&mut self) -> Result<(), TransportError> {
        let request = build_connection_request(
            LOCAL_TSAP,
            remote_tsap(CONNECTION_TYPE_PG, self.rack, self.slot),
        );
        let confirm = self.exchange(&request)?;
        check_connection_confirm(&confirm)?;

        let pdu_ref = self.next_ref();
        let setup = self.exchange(&build_setup_communication(pdu_ref, REQUESTED_PDU_LEN))?;
        let granted = parse_setup_communication(&setup)?;
        self.pdu_len = granted.min(REQUESTED_PDU_LEN);
        log::info!(
            "S7 link {} established (rack {}, slot {}, PDU {} bytes)",
            self.endpoint,
            self.rack,
            self.slot,
            self.pdu_len
        );
        Ok(())
    }

    fn read_var(&mut self, spec: &VarSpec) -> Result<Vec<u8>, TransportError> {
        let pdu_ref = self.next_ref();
        let response = self.exchange(&build_read_var(pdu_ref, spec))?;
        self.checked(parse_read_var(&response, pdu_ref))
    }
}

fn s7_address(address: &RegisterAddress) -> Result<&S7Address, TransportError> {
    match address {
        RegisterAddress::S7(a) => Ok(a),
        other => Err(TransportError::address(other, "not an S7 address")),
    }
}

fn bit_spec(address: &RegisterAddress) -> Result<VarSpec, TransportError> {
    let a = s7_address(address)?;
    if a.bit.is_none() {
        return Err(TransportError::address(address, "bit access needs DBX<byte>.<bit>"));
    }
    a.bit_offset()
        .and_then(|offset| VarSpec::bit(a.db, offset))
        .ok_or_else(|| TransportError::address(address, "beyond the S7 address range"))
}

impl RegisterTransport for S7Transport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.drop_stream();
        self.stream = Some(open_stream(
            &self.endpoint,
            self.connect_timeout,
            self.io_timeout,
        )?);
        let result = self.negotiate();
        if result.is_err() {
            self.drop_stream();
        }
        result
    }

    fn disconnect(&mut self) {
        self.drop_stream();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read_bool(&mut self, address: &RegisterAddress) -> Result<bool, TransportError> {
        let data = self.read_var(&bit_spec(address)?)?;
        data.first()
            .map(|byte| byte & 0x01 != 0)
            .ok_or_else(|| TransportError::Malformed("bit read returned no data".to_string()))
    }

    fn read_string(
        &mut self,
        address: &RegisterAddress,
        max_len: usize,
        layout: TextLayout,
    ) -> Result<String, TransportError> {
        let a = *s7_address(address)?;
        if a.bit.is_some() {
            return Err(TransportError::address(address, "text needs a byte address"));
        }

        let total = layout.byte_len(max_len);
        let chunk = usize::from(self.pdu_len)
            .saturating_sub(READ_RESPONSE_OVERHEAD)
            .max(1);
        let mut bytes = Vec::with_capacity(total);
        while bytes.len() < total {
            let count = (total - bytes.len()).min(chunk);
            let spec = u32::try_from(bytes.len())
                .ok()
                .and_then(|done| a.byte.checked_add(done))
                .and_then(|byte| VarSpec::bytes(a.db, byte, count as u16))
                .ok_or_else(|| TransportError::address(address, "beyond the S7 address range"))?;
            let data = self.read_var(&spec)?;
            if data.is_empty() {
                return Err(TransportError::Malformed(format!(
                    "empty read at {address} offset {}",
                    bytes.len()
                )));
            }
            bytes.extend_from_slice(&data);
        }
        bytes.truncate(total);

        Ok(layout.decode(&bytes)?)
    }

    fn write_bool(&mut self, address: &RegisterAddress, value: bool) -> Result<(), TransportError> {
        let spec = bit_spec(address)?;
        let pdu_ref = self.next_ref();
        let request = build_write_var(pdu_ref, &spec, &[u8::from(value)])?;
        let response = self.exchange(&request)?;
        self.checked(parse_write_var(&response, pdu_ref))
    }
}
