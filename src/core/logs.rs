/// Structured station events
///
/// Every meaningful handshake transition produces exactly one
/// [`StationEvent`]. Sinks decide where events go (log output, channels,
/// the in-memory buffer behind the status endpoint).
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::Display;

use super::state::Verdict;

/// Event severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecyclePhase {
    Started,
    Stopped,
    Failed,
}

/// How the quality path ended for a processed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UploadTag {
    /// No MES check configured
    Skipped,
    Accepted,
    Rejected,
    UploadFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RequestProcessed {
        serial: String,
        verdict: Verdict,
        upload: UploadTag,
        detail: Option<String>,
        /// Verdict replayed from a failed acknowledgment, no new upload
        replayed: bool,
    },
    RequestReset,
    TransportFault {
        error: String,
        consecutive: u32,
    },
    LinkDegraded {
        error: String,
        consecutive: u32,
    },
    LinkRecovered {
        after: u32,
    },
    InvariantViolation {
        detail: String,
    },
    CycleFault {
        panic: String,
    },
    Lifecycle {
        phase: LifecyclePhase,
        note: Option<String>,
    },
}

impl EventKind {
    pub fn level(&self) -> LogLevel {
        match self {
            EventKind::RequestProcessed {
                upload: UploadTag::UploadFailed | UploadTag::Rejected,
                ..
            }
            | EventKind::TransportFault { .. }
            | EventKind::InvariantViolation { .. } => LogLevel::Warning,
            EventKind::LinkDegraded { .. } | EventKind::CycleFault { .. } => LogLevel::Error,
            EventKind::Lifecycle {
                phase: LifecyclePhase::Failed,
                ..
            } => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::RequestProcessed {
                serial,
                verdict,
                upload,
                detail,
                replayed,
            } => {
                write!(f, "request processed: serial='{serial}' verdict={verdict} upload={upload}")?;
                if let Some(detail) = detail {
                    write!(f, " ({detail})")?;
                }
                if *replayed {
                    write!(f, " [replayed]")?;
                }
                Ok(())
            }
            EventKind::RequestReset => write!(f, "request reset"),
            EventKind::TransportFault { error, consecutive } => {
                write!(f, "transport fault #{consecutive}: {error}")
            }
            EventKind::LinkDegraded { error, consecutive } => {
                write!(f, "link degraded after {consecutive} failed cycles: {error}")
            }
            EventKind::LinkRecovered { after } => {
                write!(f, "link recovered after {after} failed cycles")
            }
            EventKind::InvariantViolation { detail } => write!(f, "invariant violation: {detail}"),
            EventKind::CycleFault { panic } => write!(f, "cycle panicked: {panic}"),
            EventKind::Lifecycle { phase, note } => match note {
                Some(note) => write!(f, "worker {phase}: {note}"),
                None => write!(f, "worker {phase}"),
            },
        }
    }
}

/// One structured event raised by a station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationEvent {
    pub timestamp: DateTime<Local>,
    pub station: String,
    pub level: LogLevel,
    pub kind: EventKind,
}

impl StationEvent {
    /// Create a new event with the current timestamp
    pub fn new(station: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Local::now(),
            station: station.into(),
            level: kind.level(),
            kind,
        }
    }

    pub fn message(&self) -> String {
        format!("[{}] {}", self.station, self.kind)
    }
}

/// Ring of recent events
pub struct LogBuffer {
    entries: Vec<StationEvent>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
        }
    }

    pub fn push(&mut self, entry: StationEvent) {
        self.entries.push(entry);

        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(0..excess);
        }
    }

    pub fn entries(&self) -> &[StationEvent] {
        &self.entries
    }

    /// Most recent `limit` events, oldest first
    pub fn tail(&self, limit: usize) -> &[StationEvent] {
        let start = self.entries.len().saturating_sub(limit);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(500)
    }
}
