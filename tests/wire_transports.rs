//! Real transports against in-process S7 and Modbus TCP servers.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use stationlink::protocol::transport::{
    ModbusTransport, RegisterTransport, S7Transport, TransportError,
};
use stationlink_protocol::{RegisterAddress, S7Address, TextLayout};

const TIMEOUT: Duration = Duration::from_secs(2);

fn spawn_server<S: Send + 'static>(
    state: S,
    serve: fn(&mut TcpStream, &S) -> Option<()>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            while serve(&mut stream, &state).is_some() {}
        }
    });
    endpoint
}

// ---- S7 -------------------------------------------------------------------

#[derive(Default)]
struct S7Memory {
    dbs: HashMap<u16, Vec<u8>>,
    pdu_len: u16,
    reads: usize,
}

type SharedS7 = Arc<Mutex<S7Memory>>;

fn tpkt(pdu: &[u8]) -> Vec<u8> {
    let total = (pdu.len() + 7) as u16;
    let mut out = vec![0x03, 0x00];
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&[0x02, 0xF0, 0x80]);
    out.extend_from_slice(pdu);
    out
}

fn ack_header(pdu_ref: [u8; 2], param_len: u16, data_len: u16) -> Vec<u8> {
    let mut s7 = vec![0x32, 0x03, 0x00, 0x00, pdu_ref[0], pdu_ref[1]];
    s7.extend_from_slice(&param_len.to_be_bytes());
    s7.extend_from_slice(&data_len.to_be_bytes());
    s7.extend_from_slice(&[0x00, 0x00]);
    s7
}

fn serve_s7(stream: &mut TcpStream, memory: &SharedS7) -> Option<()> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).ok()?;
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(total, 0);
    stream.read_exact(&mut frame[4..]).ok()?;

    if frame[5] == 0xE0 {
        let confirm = [
            0x03, 0x00, 0x00, 0x16, 0x11, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A,
            0xC1, 0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x02,
        ];
        return stream.write_all(&confirm).ok();
    }

    let s7 = &frame[7..];
    let pdu_ref = [s7[4], s7[5]];
    let function = s7[10];
    let mut memory = memory.lock();
    let reply = match function {
        0xF0 => {
            let mut pdu = ack_header(pdu_ref, 8, 0);
            pdu.extend_from_slice(&[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01]);
            pdu.extend_from_slice(&memory.pdu_len.to_be_bytes());
            pdu
        }
        0x04 | 0x05 => {
            let item = &s7[12..24];
            let bit_access = item[3] == 0x01;
            let count = u16::from_be_bytes([item[4], item[5]]) as usize;
            let db = u16::from_be_bytes([item[6], item[7]]);
            let start = u32::from_be_bytes([0, item[9], item[10], item[11]]) as usize;
            let (byte, bit) = (start / 8, start % 8);

            let Some(block) = memory.dbs.get_mut(&db) else {
                let mut pdu = ack_header(pdu_ref, 2, 1);
                pdu.extend_from_slice(&[function, 0x01, 0x0A]);
                return stream.write_all(&tpkt(&pdu)).ok();
            };

            if function == 0x05 {
                let value = s7[28];
                if value != 0 {
                    block[byte] |= 1 << bit;
                } else {
                    block[byte] &= !(1 << bit);
                }
                let mut pdu = ack_header(pdu_ref, 2, 1);
                pdu.extend_from_slice(&[0x05, 0x01, 0xFF]);
                pdu
            } else {
                let item = if bit_access {
                    vec![0xFF, 0x03, 0x00, 0x01, (block[byte] >> bit) & 1]
                } else {
                    let data = &block[byte..byte + count];
                    let mut item = vec![0xFF, 0x04];
                    item.extend_from_slice(&((count * 8) as u16).to_be_bytes());
                    item.extend_from_slice(data);
                    item
                };
                let mut pdu = ack_header(pdu_ref, 2, item.len() as u16);
                pdu.extend_from_slice(&[0x04, 0x01]);
                pdu.extend_from_slice(&item);
                memory.reads += 1;
                pdu
            }
        }
        _ => return None,
    };
    stream.write_all(&tpkt(&reply)).ok()
}

fn s7_plc(pdu_len: u16) -> (SharedS7, S7Transport) {
    let mut block = vec![0u8; 64];
    block[10] = 20;
    block[11] = 7;
    block[12..19].copy_from_slice(b"SN-0042");
    block[0] = 0b0000_0001;

    let memory = Arc::new(Mutex::new(S7Memory {
        dbs: HashMap::from([(1, block)]),
        pdu_len,
        reads: 0,
    }));
    let endpoint = spawn_server(Arc::clone(&memory), serve_s7);
    (memory, S7Transport::new(endpoint, 0, 1, TIMEOUT, TIMEOUT))
}

#[test]
fn test_s7_negotiates_and_reads_bits() {
    let (_memory, mut plc) = s7_plc(240);
    assert!(!plc.is_connected());
    plc.connect().unwrap();
    assert!(plc.is_connected());
    assert_eq!(plc.pdu_len(), 240);

    assert!(plc.read_bool(&"DB1.DBX0.0".parse().unwrap()).unwrap());
    assert!(!plc.read_bool(&"DB1.DBX0.1".parse().unwrap()).unwrap());
}

#[test]
fn test_s7_string_is_read_in_pdu_sized_chunks() {
    let (memory, mut plc) = s7_plc(30);
    plc.connect().unwrap();

    let serial = plc
        .read_string(&"DB1.DBB10".parse().unwrap(), 20, TextLayout::S7String)
        .unwrap();
    assert_eq!(serial, "SN-0042");
    // 22 bytes with 12 byte chunks
    assert_eq!(memory.lock().reads, 2);
}

#[test]
fn test_s7_write_bit_round_trips() {
    let (memory, mut plc) = s7_plc(240);
    plc.connect().unwrap();

    let response = "DB1.DBX0.5".parse().unwrap();
    plc.write_bool(&response, true).unwrap();
    assert!(plc.read_bool(&response).unwrap());
    assert_eq!(memory.lock().dbs[&1][0], 0b0010_0001);
    plc.write_bool(&response, false).unwrap();
    assert_eq!(memory.lock().dbs[&1][0], 0b0000_0001);
}

#[test]
fn test_s7_missing_block_is_a_device_error() {
    let (_memory, mut plc) = s7_plc(240);
    plc.connect().unwrap();

    let err = plc.read_bool(&"DB9.DBX0.0".parse().unwrap()).unwrap_err();
    assert!(matches!(err, TransportError::Device(_)));
    assert!(plc.is_connected());
}

#[test]
fn test_s7_rejects_foreign_addresses() {
    let (_memory, mut plc) = s7_plc(240);
    plc.connect().unwrap();
    assert!(matches!(
        plc.read_bool(&"coil:1".parse().unwrap()),
        Err(TransportError::Address { .. })
    ));
    assert!(matches!(
        plc.read_bool(&"DB1.DBB0".parse().unwrap()),
        Err(TransportError::Address { .. })
    ));
}

#[test]
fn test_s7_offsets_beyond_the_item_range_never_reach_the_wire() {
    let (memory, mut plc) = s7_plc(240);
    plc.connect().unwrap();
    let far = RegisterAddress::S7(S7Address {
        db: 1,
        byte: 600_000_000,
        bit: Some(0),
    });

    assert!(matches!(
        plc.read_bool(&far),
        Err(TransportError::Address { .. })
    ));
    assert!(matches!(
        plc.write_bool(&far, true),
        Err(TransportError::Address { .. })
    ));
    assert_eq!(memory.lock().reads, 0);
    assert!(plc.is_connected());
}

#[test]
fn test_s7_refused_connection_reports_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut plc = S7Transport::new(endpoint, 0, 1, TIMEOUT, TIMEOUT);
    assert!(matches!(plc.connect(), Err(TransportError::Connect { .. })));
    assert!(!plc.is_connected());
    assert!(matches!(
        plc.read_bool(&"DB1.DBX0.0".parse().unwrap()),
        Err(TransportError::NotConnected)
    ));
}

// ---- Modbus ---------------------------------------------------------------

#[derive(Default)]
struct ModbusMemory {
    coils: Vec<bool>,
    discretes: Vec<bool>,
    holding: Vec<u16>,
    input: Vec<u16>,
}

type SharedModbus = Arc<Mutex<ModbusMemory>>;

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, b)| acc | (u8::from(*b) << i))
        })
        .collect()
}

fn serve_modbus(stream: &mut TcpStream, memory: &SharedModbus) -> Option<()> {
    let mut mbap = [0u8; 7];
    stream.read_exact(&mut mbap).ok()?;
    let len = u16::from_be_bytes([mbap[4], mbap[5]]) as usize;
    let mut pdu = vec![0u8; len - 1];
    stream.read_exact(&mut pdu).ok()?;

    let function = pdu[0];
    let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
    let arg = u16::from_be_bytes([pdu[3], pdu[4]]);
    let mut memory = memory.lock();
    let reply = match function {
        0x01 | 0x02 => {
            let table = if function == 0x01 {
                &memory.coils
            } else {
                &memory.discretes
            };
            let bytes = pack_bits(&table[addr..addr + arg as usize]);
            let mut out = vec![function, bytes.len() as u8];
            out.extend_from_slice(&bytes);
            out
        }
        0x03 | 0x04 => {
            let table = if function == 0x03 {
                &memory.holding
            } else {
                &memory.input
            };
            let mut out = vec![function, (arg * 2) as u8];
            for word in &table[addr..addr + arg as usize] {
                out.extend_from_slice(&word.to_be_bytes());
            }
            out
        }
        0x05 => {
            memory.coils[addr] = arg == 0xFF00;
            pdu.clone()
        }
        0x06 => {
            memory.holding[addr] = arg;
            pdu.clone()
        }
        _ => vec![function | 0x80, 0x01],
    };

    let mut frame = mbap[..4].to_vec();
    frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
    frame.push(mbap[6]);
    frame.extend_from_slice(&reply);
    stream.write_all(&frame).ok()
}

fn modbus_plc(swap_bytes: bool) -> (SharedModbus, ModbusTransport) {
    let mut holding = vec![0u16; 300];
    // "SN-7" followed by NUL padding
    holding[20] = u16::from_be_bytes(*b"SN");
    holding[21] = u16::from_be_bytes(*b"-7");
    holding[10] = 0b0000_0100;

    let memory = Arc::new(Mutex::new(ModbusMemory {
        coils: vec![false; 16],
        discretes: vec![true, false, true, false],
        holding,
        input: vec![0, 1, 0, 0],
    }));
    let endpoint = spawn_server(Arc::clone(&memory), serve_modbus);
    (
        memory,
        ModbusTransport::new(endpoint, 1, swap_bytes, TIMEOUT, TIMEOUT),
    )
}

#[test]
fn test_modbus_reads_every_bit_flavour() {
    let (_memory, mut plc) = modbus_plc(false);
    plc.connect().unwrap();

    assert!(plc.read_bool(&"discrete:2".parse().unwrap()).unwrap());
    assert!(!plc.read_bool(&"discrete:1".parse().unwrap()).unwrap());
    assert!(!plc.read_bool(&"coil:3".parse().unwrap()).unwrap());
    assert!(plc.read_bool(&"holding:10.2".parse().unwrap()).unwrap());
    assert!(!plc.read_bool(&"holding:10.3".parse().unwrap()).unwrap());
    assert!(plc.read_bool(&"input:1".parse().unwrap()).unwrap());
}

#[test]
fn test_modbus_writes_coils_and_holding_bits() {
    let (memory, mut plc) = modbus_plc(false);
    plc.connect().unwrap();

    plc.write_bool(&"coil:4".parse().unwrap(), true).unwrap();
    assert!(memory.lock().coils[4]);
    assert!(plc.read_bool(&"coil:4".parse().unwrap()).unwrap());

    plc.write_bool(&"holding:10.0".parse().unwrap(), true).unwrap();
    assert_eq!(memory.lock().holding[10], 0b0000_0101);
    plc.write_bool(&"holding:10.2".parse().unwrap(), false).unwrap();
    assert_eq!(memory.lock().holding[10], 0b0000_0001);
}

#[test]
fn test_modbus_read_only_tables_refuse_writes() {
    let (_memory, mut plc) = modbus_plc(false);
    plc.connect().unwrap();
    assert!(matches!(
        plc.write_bool(&"discrete:0".parse().unwrap(), true),
        Err(TransportError::Address { .. })
    ));
    assert!(matches!(
        plc.write_bool(&"input:0".parse().unwrap(), true),
        Err(TransportError::Address { .. })
    ));
}

#[test]
fn test_modbus_reads_padded_text() {
    let (_memory, mut plc) = modbus_plc(false);
    plc.connect().unwrap();
    let serial = plc
        .read_string(&"holding:20".parse().unwrap(), 16, TextLayout::Chars)
        .unwrap();
    assert_eq!(serial, "SN-7");
}

#[test]
fn test_modbus_swapped_text() {
    let (memory, mut plc) = modbus_plc(true);
    memory.lock().holding[20] = u16::from_be_bytes(*b"NS");
    memory.lock().holding[21] = u16::from_be_bytes(*b"7-");
    plc.connect().unwrap();
    let serial = plc
        .read_string(&"holding:20".parse().unwrap(), 4, TextLayout::Chars)
        .unwrap();
    assert_eq!(serial, "SN-7");
}

#[test]
fn test_modbus_long_text_spans_several_requests() {
    let (memory, mut plc) = modbus_plc(false);
    {
        let mut memory = memory.lock();
        for (i, word) in memory.holding[0..130].iter_mut().enumerate() {
            *word = if i < 125 { u16::from_be_bytes(*b"ab") } else { 0 };
        }
    }
    plc.connect().unwrap();
    let text = plc
        .read_string(&"holding:0".parse().unwrap(), 260, TextLayout::Chars)
        .unwrap();
    assert_eq!(text.len(), 250);
}
