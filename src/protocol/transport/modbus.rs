use std::{net::TcpStream, time::Duration};

use rmodbus::client::ModbusRequest;
use stationlink_protocol::{
    modbus::{
        generate_get_bits_request, generate_get_words_request, generate_set_coil_request,
        generate_set_holding_request, parse_get_bits, parse_get_words, parse_mbap_header,
        parse_write_ack, MAX_READ_WORDS, MBAP_HEADER_LEN,
    },
    words_to_bytes, CodecError, ModbusAddress, ModbusTable, RegisterAddress, TextLayout,
};

use super::{open_stream, round_trip, RegisterTransport, TransportError};

/// Modbus TCP client for a single unit id.
pub struct ModbusTransport {
    endpoint: String,
    unit_id: u8,
    swap_bytes: bool,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<TcpStream>,
}

impl ModbusTransport {
    pub fn new(
        endpoint: String,
        unit_id: u8,
        swap_bytes: bool,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            unit_id,
            swap_bytes,
            connect_timeout,
            io_timeout,
            stream: None,
        }
    }

    fn drop_stream(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("Dropped Modbus socket to {}", self.endpoint);
        }
    }

    /// Send a generated request and return the raw response frame.
    fn exchange(
        &mut self,
        generated: Result<(ModbusRequest, Vec<u8>), CodecError>,
    ) -> Result<(ModbusRequest, Vec<u8>), TransportError> {
        let (request, raw) = generated?;
        let timeout = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let result = round_trip(stream, &raw, MBAP_HEADER_LEN, timeout, |header| {
            let mut buf = [0u8; MBAP_HEADER_LEN];
            buf.copy_from_slice(header);
            Ok(parse_mbap_header(buf)? - MBAP_HEADER_LEN)
        });
        match result {
            Ok(response) => Ok((request, response)),
            Err(err) => {
                self.drop_stream();
                Err(err)
            }
        }
    }

    fn checked<T>(&mut self, parsed: Result<T, CodecError>) -> Result<T, TransportError> {
        let result = parsed.map_err(TransportError::from);
        if result.as_ref().is_err_and(|e| e.breaks_link()) {
            self.drop_stream();
        }
        result
    }

    fn read_bit(&mut self, table: ModbusTable, register: u16) -> Result<bool, TransportError> {
        let (request, response) =
            self.exchange(generate_get_bits_request(self.unit_id, table, register, 1))?;
        let bits = self.checked(parse_get_bits(&request, &response, 1))?;
        Ok(bits[0])
    }

    fn read_words(
        &mut self,
        table: ModbusTable,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let (request, response) =
            self.exchange(generate_get_words_request(self.unit_id, table, start, count))?;
        self.checked(parse_get_words(&request, &response, count))
    }

    fn write_word(&mut self, register: u16, value: u16) -> Result<(), TransportError> {
        let (request, response) =
            self.exchange(generate_set_holding_request(self.unit_id, register, value))?;
        self.checked(parse_write_ack(&request, &response))
    }
}

fn modbus_address(address: &RegisterAddress) -> Result<ModbusAddress, TransportError> {
    match address {
        RegisterAddress::Modbus(a) => Ok(*a),
        other => Err(TransportError::address(other, "not a Modbus address")),
    }
}

impl RegisterTransport for ModbusTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.drop_stream();
        self.stream = Some(open_stream(
            &self.endpoint,
            self.connect_timeout,
            self.io_timeout,
        )?);
        log::info!(
            "Modbus link {} established (unit {})",
            self.endpoint,
            self.unit_id
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.drop_stream();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read_bool(&mut self, address: &RegisterAddress) -> Result<bool, TransportError> {
        let a = modbus_address(address)?;
        if !a.table.is_word() {
            return self.read_bit(a.table, a.register);
        }
        let word = self.read_words(a.table, a.register, 1)?[0];
        Ok(match a.bit {
            Some(bit) => word & (1 << bit) != 0,
            None => word != 0,
        })
    }

    fn read_string(
        &mut self,
        address: &RegisterAddress,
        max_len: usize,
        layout: TextLayout,
    ) -> Result<String, TransportError> {
        let a = modbus_address(address)?;
        if !a.table.is_word() || a.bit.is_some() {
            return Err(TransportError::address(
                address,
                "text needs a holding or input register",
            ));
        }

        let total = layout.byte_len(max_len);
        let registers = total.div_ceil(2);
        let mut words = Vec::with_capacity(registers);
        while words.len() < registers {
            let count = (registers - words.len()).min(usize::from(MAX_READ_WORDS)) as u16;
            let start = a
                .register
                .checked_add(words.len() as u16)
                .ok_or_else(|| TransportError::address(address, "text runs past register 65535"))?;
            words.extend(self.read_words(a.table, start, count)?);
        }

        let mut bytes = words_to_bytes(&words, self.swap_bytes);
        bytes.truncate(total);
        Ok(layout.decode(&bytes)?)
    }

    fn write_bool(&mut self, address: &RegisterAddress, value: bool) -> Result<(), TransportError> {
        let a = modbus_address(address)?;
        match (a.table, a.bit) {
            (ModbusTable::Coil, _) => {
                let (request, response) =
                    self.exchange(generate_set_coil_request(self.unit_id, a.register, value))?;
                self.checked(parse_write_ack(&request, &response))
            }
            (ModbusTable::Holding, Some(bit)) => {
                // Read-modify-write; the caller holds the link for the whole call.
                let word = self.read_words(ModbusTable::Holding, a.register, 1)?[0];
                let updated = if value {
                    word | (1 << bit)
                } else {
                    word & !(1 << bit)
                };
                if updated == word {
                    return Ok(());
                }
                self.write_word(a.register, updated)
            }
            (ModbusTable::Holding, None) => self.write_word(a.register, u16::from(value)),
            (table, _) => Err(TransportError::address(
                address,
                format!("{table} table is read-only"),
            )),
        }
    }
}
