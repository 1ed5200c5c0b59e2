/// Runtime building blocks shared by the engine and the scheduler
///
/// - Station state, snapshots and the state board
/// - Structured station events and the recent-event buffer
/// - Shared PLC links keyed by physical identity
/// - Cooperative shutdown signalling for blocking workers
pub mod logs;
pub mod pool;
pub mod shutdown;
pub mod state;

pub use logs::{EventKind, LifecyclePhase, LogBuffer, LogLevel, StationEvent, UploadTag};
pub use pool::{ConnectionPool, LinkHandle, LinkKey, SharedLink};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use state::{
    HandshakeBits, HandshakeTransition, LinkHealth, Measurement, PendingAck, StateBoard,
    StationSnapshot, StationState, Verdict,
};
