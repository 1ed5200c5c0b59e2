/// Event sink traits
///
/// The engine and the scheduler only ever talk to [`LogSink`]; whether
/// events end up in the log or the status buffer is decided by the sink
/// handed to them.
use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::logs::{LogBuffer, LogLevel, StationEvent};

/// Write-only destination for station events.
///
/// Implementations must not block the calling worker for long.
pub trait LogSink: Send + Sync {
    fn record(&self, event: StationEvent);
}

/// Forwards events to the `log` facade at their own level
pub struct LoggingSink;

impl LogSink for LoggingSink {
    fn record(&self, event: StationEvent) {
        match event.level {
            LogLevel::Info => log::info!("{}", event.message()),
            LogLevel::Warning => log::warn!("{}", event.message()),
            LogLevel::Error => log::error!("{}", event.message()),
        }
    }
}

/// Keeps recent events for the status endpoint
#[derive(Clone)]
pub struct BufferSink {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl BufferSink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_entries))),
        }
    }

    pub fn buffer(&self) -> Arc<Mutex<LogBuffer>> {
        Arc::clone(&self.buffer)
    }

    /// Copy of the most recent `limit` events
    pub fn recent(&self, limit: usize) -> Vec<StationEvent> {
        self.buffer.lock().tail(limit).to_vec()
    }
}

impl LogSink for BufferSink {
    fn record(&self, event: StationEvent) {
        self.buffer.lock().push(event);
    }
}

/// Delivers each event to every inner sink in order
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

impl LogSink for FanoutSink {
    fn record(&self, event: StationEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
