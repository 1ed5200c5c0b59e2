use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    path::Path,
    time::Duration,
};
use thiserror::Error;

use stationlink_protocol::{
    modbus::MODBUS_TCP_PORT, s7::ISO_TCP_PORT, ModbusTable, Protocol, RegisterAddress,
    TextLayout, S7_MAX_BYTE,
};

use crate::core::pool::LinkKey;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config extension '{0}' (expected .toml or .json)")]
    Extension(String),
    #[error("duplicate {kind} id '{id}'")]
    Duplicate { kind: &'static str, id: String },
    #[error("link '{link}': {reason}")]
    Link { link: String, reason: String },
    #[error("station '{station}': {reason}")]
    Station { station: String, reason: String },
}

fn station_error(station: &StationConfig, reason: impl Into<String>) -> ConfigError {
    ConfigError::Station {
        station: station.id.clone(),
        reason: reason.into(),
    }
}

/// Root configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub mes: Option<MesSettings>,
    #[serde(default)]
    pub status: Option<StatusSettings>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Default cadence for stations without their own interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive failed cycles before a station reports its link as degraded
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Recent events kept for the status endpoint
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_degraded_threshold() -> u32 {
    5
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

fn default_event_buffer() -> usize {
    500
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            degraded_threshold: default_degraded_threshold(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SchedulerSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Exponential backoff applied between connection attempts on one link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,
}

fn default_initial_interval_ms() -> u64 {
    500
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_randomization_factor() -> f64 {
    0.2
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MesSettings {
    pub endpoint: String,
    #[serde(default = "default_mes_timeout_ms")]
    pub timeout_ms: u64,
    /// Sent as a bearer token when present
    #[serde(default)]
    pub token: Option<String>,
}

fn default_mes_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    #[serde(default = "default_status_listen")]
    pub listen: String,
}

fn default_status_listen() -> String {
    "127.0.0.1:8087".to_string()
}

/// One configured PLC endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub id: String,
    pub host: String,
    /// Defaults to 102 for S7 and 502 for Modbus
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(flatten)]
    pub protocol: LinkProtocol,
}

fn default_io_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum LinkProtocol {
    S7 {
        #[serde(default)]
        rack: u16,
        #[serde(default = "default_slot")]
        slot: u16,
    },
    Modbus {
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        /// Low byte first when unpacking text registers
        #[serde(default)]
        swap_bytes: bool,
    },
}

fn default_slot() -> u16 {
    1
}

fn default_unit_id() -> u8 {
    1
}

impl LinkConfig {
    pub fn protocol(&self) -> Protocol {
        match self.protocol {
            LinkProtocol::S7 { .. } => Protocol::S7,
            LinkProtocol::Modbus { .. } => Protocol::Modbus,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.protocol {
            LinkProtocol::S7 { .. } => ISO_TCP_PORT,
            LinkProtocol::Modbus { .. } => MODBUS_TCP_PORT,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Whether a transport built for `self` behaves exactly like one built for `other`.
    fn same_wire_settings(&self, other: &LinkConfig) -> bool {
        self.protocol == other.protocol
            && self.io_timeout() == other.io_timeout()
            && self.connect_timeout() == other.connect_timeout()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCheck {
    /// Every processed unit passes
    #[default]
    None,
    /// Pass only when MES accepts the upload and every local check passed
    Mes,
}

/// The four canonical handshake bits of a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeSignals {
    pub request: RegisterAddress,
    pub response: RegisterAddress,
    pub ok: RegisterAddress,
    pub ng: RegisterAddress,
}

impl HandshakeSignals {
    fn iter(&self) -> impl Iterator<Item = (&'static str, &RegisterAddress)> {
        [
            ("request", &self.request),
            ("response", &self.response),
            ("ok", &self.ok),
            ("ng", &self.ng),
        ]
        .into_iter()
    }
}

/// Fixed-length text field on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBinding {
    pub address: RegisterAddress,
    pub max_len: usize,
    #[serde(default)]
    pub layout: TextLayout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    /// Pass/fail bit; reported as 1.0 or 0.0
    Bit(RegisterAddress),
    /// Numeric value stored as text
    Text(TextBinding),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementBinding {
    pub key: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    pub source: MeasurementSource,
}

impl MeasurementBinding {
    /// Open limits always pass; NaN never does.
    pub fn within_limits(&self, value: f64) -> bool {
        !value.is_nan()
            && self.lower.is_none_or(|lower| value >= lower)
            && self.upper.is_none_or(|upper| value <= upper)
    }
}

/// Static description of one station, shared read-only by its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub id: String,
    pub link: String,
    pub resource_code: String,
    pub station_code: String,
    #[serde(default)]
    pub work_order_code: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub quality_check: QualityCheck,
    pub signals: HandshakeSignals,
    #[serde(default)]
    pub serial: Option<TextBinding>,
    /// Bits that must all be set for the local result to pass
    #[serde(default)]
    pub aux_pass: Vec<RegisterAddress>,
    #[serde(default)]
    pub measurements: Vec<MeasurementBinding>,
}

impl StationConfig {
    pub fn poll_interval(&self, settings: &SchedulerSettings) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .unwrap_or(settings.poll_interval_ms)
                .max(1),
        )
    }

    fn text_bindings(&self) -> impl Iterator<Item = (String, &TextBinding)> {
        let serial = self
            .serial
            .iter()
            .map(|binding| ("serial".to_string(), binding));
        let measured = self.measurements.iter().filter_map(|m| match &m.source {
            MeasurementSource::Text(binding) => Some((format!("measurement '{}'", m.key), binding)),
            MeasurementSource::Bit(_) => None,
        });
        serial.chain(measured)
    }

    fn bit_reads(&self) -> impl Iterator<Item = (String, &RegisterAddress)> {
        let signals = self
            .signals
            .iter()
            .map(|(name, address)| (format!("signal '{name}'"), address));
        let aux = self
            .aux_pass
            .iter()
            .map(|address| ("aux_pass".to_string(), address));
        let measured = self.measurements.iter().filter_map(|m| match &m.source {
            MeasurementSource::Bit(address) => Some((format!("measurement '{}'", m.key), address)),
            MeasurementSource::Text(_) => None,
        });
        signals.chain(aux).chain(measured)
    }

    fn validate(&self, link: &LinkConfig, has_mes: bool) -> Result<(), ConfigError> {
        let protocol = link.protocol();

        for (what, address) in self.bit_reads() {
            if address.protocol() != protocol {
                return Err(station_error(
                    self,
                    format!("{what} address {address} does not match {protocol} link '{}'", link.id),
                ));
            }
            match address {
                RegisterAddress::S7(a) if a.bit.is_none() => {
                    return Err(station_error(
                        self,
                        format!("{what} address {address} needs a bit offset"),
                    ))
                }
                _ => {}
            }
        }

        for (name, address) in [
            ("response", &self.signals.response),
            ("ok", &self.signals.ok),
            ("ng", &self.signals.ng),
        ] {
            if let RegisterAddress::Modbus(a) = address {
                if !a.table.is_writable() {
                    return Err(station_error(
                        self,
                        format!("signal '{name}' is written but {address} is read-only"),
                    ));
                }
            }
        }

        for (what, binding) in self.text_bindings() {
            let address = &binding.address;
            if address.protocol() != protocol {
                return Err(station_error(
                    self,
                    format!("{what} address {address} does not match {protocol} link '{}'", link.id),
                ));
            }
            if binding.max_len == 0 {
                return Err(station_error(self, format!("{what} has a zero max_len")));
            }
            if address.bit().is_some() {
                return Err(station_error(
                    self,
                    format!("{what} address {address} must not carry a bit offset"),
                ));
            }
            match address {
                RegisterAddress::Modbus(a)
                    if !matches!(a.table, ModbusTable::Holding | ModbusTable::Input) =>
                {
                    return Err(station_error(
                        self,
                        format!("{what} must live in holding or input registers"),
                    ));
                }
                RegisterAddress::S7(a) => {
                    let last = u64::from(a.byte) + binding.layout.byte_len(binding.max_len) as u64 - 1;
                    if last > u64::from(S7_MAX_BYTE) {
                        return Err(station_error(
                            self,
                            format!("{what} at {address} runs past byte {S7_MAX_BYTE}"),
                        ));
                    }
                }
                _ => {}
            }
        }

        if self.quality_check == QualityCheck::Mes {
            if self.serial.is_none() {
                return Err(station_error(
                    self,
                    "quality_check = \"mes\" requires a serial binding",
                ));
            }
            if !has_mes {
                return Err(station_error(
                    self,
                    "quality_check = \"mes\" requires a [mes] section",
                ));
            }
        }

        Ok(())
    }
}

impl AppConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document and validate it
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file, picking the format from its extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::from_toml_str(&content),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json(&content),
            other => Err(ConfigError::Extension(other.unwrap_or_default().to_string())),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn link(&self, id: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|link| link.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut link_ids = HashSet::new();
        let mut endpoints: HashMap<LinkKey, &LinkConfig> = HashMap::new();
        for link in &self.links {
            if !link_ids.insert(link.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "link",
                    id: link.id.clone(),
                });
            }
            if link.host.trim().is_empty() {
                return Err(ConfigError::Link {
                    link: link.id.clone(),
                    reason: "host is empty".to_string(),
                });
            }
            // Links on one endpoint share a single transport.
            match endpoints.entry(LinkKey::of(link)) {
                Entry::Occupied(first) if !first.get().same_wire_settings(link) => {
                    return Err(ConfigError::Link {
                        link: link.id.clone(),
                        reason: format!(
                            "shares {} with link '{}' but differs in timeouts or byte order",
                            link.endpoint(),
                            first.get().id
                        ),
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(link);
                }
            }
        }

        let mut station_ids = HashSet::new();
        for station in &self.stations {
            if !station_ids.insert(station.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "station",
                    id: station.id.clone(),
                });
            }
            let link = self.link(&station.link).ok_or_else(|| {
                station_error(station, format!("unknown link '{}'", station.link))
            })?;
            station.validate(link, self.mes.is_some())?;
        }

        Ok(())
    }
}
