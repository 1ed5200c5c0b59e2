use parking_lot::Mutex;
use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    api::{
        engine::{CycleError, HandshakeEngine},
        reporter::MesReporter,
        traits::LogSink,
    },
    cli::config::{LinkConfig, SchedulerSettings, StationConfig},
    core::{
        logs::{EventKind, LifecyclePhase, StationEvent},
        pool::{ConnectionPool, LinkHandle},
        shutdown::{ShutdownSignal, ShutdownTrigger},
        state::{LinkHealth, StateBoard, StationState},
    },
    protocol::transport::TransportError,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("station '{0}' is already running")]
    AlreadyRunning(String),
    #[error("station '{station}' refers to unknown link '{link}'")]
    UnknownLink { station: String, link: String },
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Everything a station worker needs besides its own config.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub settings: SchedulerSettings,
    pub links: Vec<LinkConfig>,
    pub pool: Arc<ConnectionPool>,
    pub reporter: Arc<dyn MesReporter>,
    pub sink: Arc<dyn LogSink>,
    pub board: Arc<StateBoard>,
}

/// Outcome of [`SchedulerHandle::stop`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: Vec<String>,
    /// Workers still inside a cycle when the grace period ran out
    pub timed_out: Vec<String>,
}

pub struct PollingScheduler;

impl PollingScheduler {
    /// Spawn one blocking worker per station.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        stations: Vec<Arc<StationConfig>>,
        deps: SchedulerDeps,
    ) -> Result<SchedulerHandle, SchedulerError> {
        let (trigger, signal) = ShutdownSignal::pair();
        let handle = SchedulerHandle {
            deps,
            trigger,
            signal,
            workers: Mutex::new(HashMap::new()),
        };
        for station in stations {
            handle.start_station(station)?;
        }
        Ok(handle)
    }
}

pub struct SchedulerHandle {
    deps: SchedulerDeps,
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Start a worker for `config` unless one is already running for its id.
    pub fn start_station(&self, config: Arc<StationConfig>) -> Result<(), SchedulerError> {
        if self.trigger.is_triggered() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut workers = self.workers.lock();
        if workers
            .get(&config.id)
            .is_some_and(|worker| !worker.is_finished())
        {
            return Err(SchedulerError::AlreadyRunning(config.id.clone()));
        }

        let link = self
            .deps
            .links
            .iter()
            .find(|link| link.id == config.link)
            .ok_or_else(|| SchedulerError::UnknownLink {
                station: config.id.clone(),
                link: config.link.clone(),
            })?;
        let worker = StationWorker {
            interval: config.poll_interval(&self.deps.settings),
            degraded_threshold: self.deps.settings.degraded_threshold.max(1),
            transport: LinkHandle::new(self.deps.pool.acquire(link)),
            reporter: Arc::clone(&self.deps.reporter),
            sink: Arc::clone(&self.deps.sink),
            board: Arc::clone(&self.deps.board),
            signal: self.signal.clone(),
            config: Arc::clone(&config),
        };

        log::info!(
            "Starting station '{}' on link '{}' every {}ms",
            config.id,
            config.link,
            worker.interval.as_millis()
        );
        let join = tokio::task::spawn_blocking(move || worker.run());
        workers.insert(config.id.clone(), join);
        Ok(())
    }

    /// Ids of stations whose worker has not exited.
    pub fn running_stations(&self) -> Vec<String> {
        let mut ids = self
            .workers
            .lock()
            .iter()
            .filter(|(_, worker)| !worker.is_finished())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn board(&self) -> Arc<StateBoard> {
        Arc::clone(&self.deps.board)
    }

    /// Signal every worker, wait up to the grace period, then close all links.
    pub async fn stop(self) -> StopReport {
        self.trigger.trigger();
        let deadline = Instant::now() + self.deps.settings.shutdown_grace();
        let workers = std::mem::take(&mut *self.workers.lock());

        let mut report = StopReport::default();
        for (id, worker) in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, worker).await {
                Ok(Ok(())) => report.stopped.push(id),
                Ok(Err(err)) => {
                    log::error!("Station '{id}' worker ended abnormally: {err}");
                    report.stopped.push(id);
                }
                Err(_) => {
                    log::warn!("Station '{id}' did not stop within the grace period");
                    report.timed_out.push(id);
                }
            }
        }

        let pool = Arc::clone(&self.deps.pool);
        if let Err(err) = tokio::task::spawn_blocking(move || pool.close_all()).await {
            log::error!("Failed to close links: {err}");
        }
        report.stopped.sort();
        report.timed_out.sort();
        log::info!(
            "Scheduler stopped ({} stations, {} timed out)",
            report.stopped.len(),
            report.timed_out.len()
        );
        report
    }
}

/// Consecutive-failure bookkeeping for one station.
struct FailureTracker {
    threshold: u32,
    health: LinkHealth,
}

impl FailureTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            health: LinkHealth::default(),
        }
    }

    /// Record a failed cycle and return the events it causes.
    fn failure(&mut self, error: &TransportError) -> Vec<EventKind> {
        self.health.consecutive_failures += 1;
        self.health.last_error = Some(error.to_string());
        let consecutive = self.health.consecutive_failures;

        let mut events = vec![EventKind::TransportFault {
            error: error.to_string(),
            consecutive,
        }];
        if consecutive >= self.threshold && !self.health.degraded {
            self.health.degraded = true;
            events.push(EventKind::LinkDegraded {
                error: error.to_string(),
                consecutive,
            });
        }
        events
    }

    fn success(&mut self) -> Option<EventKind> {
        let after = std::mem::take(&mut self.health.consecutive_failures);
        self.health.last_error = None;
        if std::mem::take(&mut self.health.degraded) {
            Some(EventKind::LinkRecovered { after })
        } else {
            None
        }
    }
}

struct StationWorker {
    config: Arc<StationConfig>,
    interval: Duration,
    degraded_threshold: u32,
    transport: LinkHandle,
    reporter: Arc<dyn MesReporter>,
    sink: Arc<dyn LogSink>,
    board: Arc<StateBoard>,
    signal: ShutdownSignal,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl StationWorker {
    fn emit(&self, kind: EventKind) {
        self.sink
            .record(StationEvent::new(self.config.id.as_str(), kind));
    }

    fn run(mut self) {
        self.emit(EventKind::Lifecycle {
            phase: LifecyclePhase::Started,
            note: Some(self.transport.link().label().to_string()),
        });

        let engine = HandshakeEngine::new(Arc::clone(&self.sink)).with_shutdown(self.signal.clone());
        let mut state = StationState::new();
        let mut tracker = FailureTracker::new(self.degraded_threshold);

        loop {
            if self.signal.is_triggered() {
                break;
            }

            let cycle = panic::catch_unwind(AssertUnwindSafe(|| {
                engine.run_once(
                    &self.config,
                    &mut state,
                    &mut self.transport,
                    self.reporter.as_ref(),
                )
            }));

            match cycle {
                Ok(Ok(_)) => {
                    if let Some(event) = tracker.success() {
                        self.emit(event);
                    }
                }
                Ok(Err(CycleError::Cancelled | CycleError::Transport(TransportError::Closed))) => {
                    break
                }
                Ok(Err(CycleError::Transport(TransportError::Backoff(remaining)))) => {
                    log::trace!(
                        "[{}] link backing off for {}ms",
                        self.config.id,
                        remaining.as_millis()
                    );
                }
                Ok(Err(CycleError::Transport(err))) => {
                    for event in tracker.failure(&err) {
                        self.emit(event);
                    }
                }
                Err(payload) => {
                    self.emit(EventKind::CycleFault {
                        panic: panic_message(payload.as_ref()),
                    });
                }
            }

            let mut snapshot = state.snapshot(&self.config.id);
            snapshot.health = tracker.health.clone();
            self.board.publish(snapshot);

            if self.signal.wait(self.interval) {
                break;
            }
        }

        self.emit(EventKind::Lifecycle {
            phase: LifecyclePhase::Stopped,
            note: None,
        });
    }
}
