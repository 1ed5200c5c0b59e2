#![allow(dead_code)]

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};

use stationlink::{
    api::{
        reporter::{MesReporter, UploadOutcome, UploadRequest},
        traits::BufferSink,
    },
    cli::config::{AppConfig, LinkConfig, StationConfig},
    core::logs::{EventKind, StationEvent},
    protocol::transport::{RegisterTransport, TransportError, TransportFactory},
};
use stationlink_protocol::{RegisterAddress, TextLayout};

pub const LINE: &str = r#"
[mes]
endpoint = "http://127.0.0.1:1/upload"

[[links]]
id = "plc"
host = "127.0.0.1"
protocol = "s7"

[[stations]]
id = "op10"
link = "plc"
resource_code = "R-10"
station_code = "OP10"
work_order_code = "WO-1"
quality_check = "mes"
signals = { request = "DB1.DBX0.0", response = "DB1.DBX0.1", ok = "DB1.DBX0.2", ng = "DB1.DBX0.3" }
serial = { address = "DB1.DBB10", max_len = 20, layout = "s7_string" }
aux_pass = ["DB1.DBX1.0"]

[[stations.measurements]]
key = "torque"
unit = "Nm"
lower = 1.5
upper = 2.5
source = { text = { address = "DB1.DBB40", max_len = 8 } }

[[stations]]
id = "op20"
link = "plc"
resource_code = "R-20"
station_code = "OP20"
signals = { request = "DB2.DBX0.0", response = "DB2.DBX0.1", ok = "DB2.DBX0.2", ng = "DB2.DBX0.3" }
"#;

pub fn line() -> AppConfig {
    AppConfig::from_toml_str(LINE).unwrap()
}

pub fn station(config: &AppConfig, id: &str) -> StationConfig {
    config
        .stations
        .iter()
        .find(|s| s.id == id)
        .cloned()
        .unwrap()
}

/// In-memory PLC shared between a test and the transports it hands out.
#[derive(Default)]
pub struct PlcMemory {
    pub bits: HashMap<String, bool>,
    pub texts: HashMap<String, String>,
    /// Every successful write, in order
    pub writes: Vec<(String, bool)>,
    pub reads: usize,
    /// Fail reads of these addresses
    pub broken_reads: Vec<String>,
    /// Fail writes of these addresses
    pub broken_writes: Vec<String>,
    /// Fail every call
    pub offline: bool,
    pub connected: bool,
    pub connects: usize,
}

#[derive(Clone, Default)]
pub struct FakePlc(pub Arc<Mutex<PlcMemory>>);

impl FakePlc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: &str, value: bool) {
        self.0.lock().bits.insert(address.to_string(), value);
    }

    pub fn bit(&self, address: &str) -> bool {
        self.0.lock().bits.get(address).copied().unwrap_or(false)
    }

    pub fn set_text(&self, address: &str, value: &str) {
        self.0
            .lock()
            .texts
            .insert(address.to_string(), value.to_string());
    }

    pub fn writes(&self) -> Vec<(String, bool)> {
        self.0.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.0.lock().writes.clear();
    }

    pub fn with(&self, f: impl FnOnce(&mut PlcMemory)) {
        f(&mut self.0.lock())
    }
}

fn offline() -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "fake plc offline",
    ))
}

impl RegisterTransport for FakePlc {
    fn connect(&mut self) -> Result<(), TransportError> {
        let mut mem = self.0.lock();
        if mem.offline {
            return Err(offline());
        }
        mem.connects += 1;
        mem.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.0.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        let mem = self.0.lock();
        mem.connected && !mem.offline
    }

    fn read_bool(&mut self, address: &RegisterAddress) -> Result<bool, TransportError> {
        let mut mem = self.0.lock();
        let key = address.to_string();
        if mem.offline {
            return Err(offline());
        }
        if mem.broken_reads.contains(&key) {
            return Err(TransportError::Device(format!("read of {key} refused")));
        }
        mem.reads += 1;
        Ok(mem.bits.get(&key).copied().unwrap_or(false))
    }

    fn read_string(
        &mut self,
        address: &RegisterAddress,
        max_len: usize,
        _layout: TextLayout,
    ) -> Result<String, TransportError> {
        let mut mem = self.0.lock();
        let key = address.to_string();
        if mem.offline {
            return Err(offline());
        }
        if mem.broken_reads.contains(&key) {
            return Err(TransportError::Device(format!("read of {key} refused")));
        }
        mem.reads += 1;
        let text = mem.texts.get(&key).cloned().unwrap_or_default();
        Ok(text.chars().take(max_len).collect())
    }

    fn write_bool(&mut self, address: &RegisterAddress, value: bool) -> Result<(), TransportError> {
        let mut mem = self.0.lock();
        let key = address.to_string();
        if mem.offline || mem.broken_writes.contains(&key) {
            return Err(offline());
        }
        mem.bits.insert(key.clone(), value);
        mem.writes.push((key, value));
        Ok(())
    }
}

/// Hands out clones of one [`FakePlc`] for every link.
pub struct FakeFactory(pub FakePlc);

impl TransportFactory for FakeFactory {
    fn create(&self, _link: &LinkConfig) -> Box<dyn RegisterTransport> {
        Box::new(self.0.clone())
    }
}

/// Scripted MES that records every upload.
pub struct FakeMes {
    pub outcome: Mutex<UploadOutcome>,
    pub uploads: Mutex<Vec<UploadRequest>>,
    /// How long each upload takes to answer
    pub delay: Duration,
}

impl FakeMes {
    pub fn answering(outcome: UploadOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            uploads: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(outcome: UploadOutcome, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::answering(outcome)
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }
}

impl MesReporter for FakeMes {
    fn upload(&self, request: &UploadRequest) -> UploadOutcome {
        self.uploads.lock().push(request.clone());
        std::thread::sleep(self.delay);
        self.outcome.lock().clone()
    }
}

pub fn kinds(sink: &BufferSink) -> Vec<EventKind> {
    sink.recent(usize::MAX)
        .into_iter()
        .map(|event: StationEvent| event.kind)
        .collect()
}
