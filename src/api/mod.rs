pub mod engine;
pub mod reporter;
pub mod scheduler;
pub mod status;
pub mod traits;

pub use engine::{CycleError, CycleOutcome, CycleResult, HandshakeEngine};
pub use reporter::{
    HttpMesReporter, MesReporter, NullReporter, ReporterError, TestResult, UploadOutcome,
    UploadRequest,
};
pub use scheduler::{PollingScheduler, SchedulerDeps, SchedulerError, SchedulerHandle, StopReport};
pub use status::StatusState;
pub use traits::{BufferSink, FanoutSink, LogSink, LoggingSink};
