use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::Display;

use crate::api::reporter::UploadOutcome;

/// Final decision for one processed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Verdict {
    Ok,
    Ng,
}

/// Edge computed from a freshly read Request/Response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HandshakeTransition {
    NoChange,
    RequestRising,
    RequestFalling,
}

impl HandshakeTransition {
    pub fn detect(request: bool, response: bool) -> Self {
        match (request, response) {
            (true, false) => Self::RequestRising,
            (false, true) => Self::RequestFalling,
            _ => Self::NoChange,
        }
    }
}

/// Last observed values of the four handshake bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBits {
    pub request: bool,
    pub response: bool,
    pub ok: bool,
    pub ng: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub key: String,
    pub value: f64,
    pub unit: String,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub pass: bool,
}

/// Verdict decided for a serial whose acknowledgment could not be written.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAck {
    pub serial: String,
    pub verdict: Verdict,
    pub upload: Option<UploadOutcome>,
    pub measurements: Vec<Measurement>,
    pub since: DateTime<Local>,
}

/// Mutable per-station state, owned by the station's worker.
///
/// Only the handshake engine mutates it; everyone else gets a
/// [`StationSnapshot`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationState {
    pub(crate) bits: HandshakeBits,
    pub(crate) serial: Option<String>,
    pub(crate) measurements: Vec<Measurement>,
    pub(crate) verdict: Option<Verdict>,
    pub(crate) cycles: u64,
    pub(crate) last_success: Option<DateTime<Local>>,
    pub(crate) pending: Option<PendingAck>,
    pub(crate) invariant_flagged: bool,
}

impl StationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits(&self) -> HandshakeBits {
        self.bits
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// Number of committed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn last_success(&self) -> Option<DateTime<Local>> {
        self.last_success
    }

    pub fn pending(&self) -> Option<&PendingAck> {
        self.pending.as_ref()
    }

    pub fn snapshot(&self, station: &str) -> StationSnapshot {
        StationSnapshot {
            station: station.to_string(),
            bits: self.bits,
            serial: self.serial.clone(),
            measurements: self.measurements.clone(),
            verdict: self.verdict,
            cycles: self.cycles,
            last_success: self.last_success,
            pending_serial: self.pending.as_ref().map(|p| p.serial.clone()),
            health: LinkHealth::default(),
        }
    }
}

/// Failure counters kept by the scheduler next to the state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHealth {
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_error: Option<String>,
}

/// Point-in-time copy of a station's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub station: String,
    pub bits: HandshakeBits,
    pub serial: Option<String>,
    pub measurements: Vec<Measurement>,
    pub verdict: Option<Verdict>,
    pub cycles: u64,
    pub last_success: Option<DateTime<Local>>,
    pub pending_serial: Option<String>,
    pub health: LinkHealth,
}

/// Latest snapshot of every station.
///
/// Writers replace whole snapshots; the lock is never held across I/O.
#[derive(Debug, Default)]
pub struct StateBoard {
    snapshots: RwLock<HashMap<String, StationSnapshot>>,
}

impl StateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: StationSnapshot) {
        self.snapshots
            .write()
            .insert(snapshot.station.clone(), snapshot);
    }

    pub fn get(&self, station: &str) -> Option<StationSnapshot> {
        self.snapshots.read().get(station).cloned()
    }

    /// All snapshots ordered by station id.
    pub fn all(&self) -> Vec<StationSnapshot> {
        let mut all = self.snapshots.read().values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.station.cmp(&b.station));
        all
    }
}
