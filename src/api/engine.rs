//! The station handshake state machine.
//!
//! One call to [`HandshakeEngine::run_once`] is one cycle:
//!
//! 1. read Request, Response, Ok and Ng;
//! 2. Request rising (Request set, Response clear): read the payload, decide a
//!    verdict (uploading to MES when configured), write Ok/Ng, then raise
//!    Response;
//! 3. Request falling (Request clear, Response set): clear Ok, Ng, then
//!    Response;
//! 4. anything else: no writes.
//!
//! State is only committed once every read and write of the cycle succeeded.
//! Shutdown is checked before every read and before the MES upload; a
//! cancelled cycle leaves the state and the PLC untouched.

use chrono::Local;
use std::sync::Arc;
use thiserror::Error;

use stationlink_protocol::RegisterAddress;

use crate::{
    api::{
        reporter::{MesReporter, TestResult, UploadOutcome, UploadRequest},
        traits::LogSink,
    },
    cli::config::{MeasurementSource, QualityCheck, StationConfig, TextBinding},
    core::{
        logs::{EventKind, StationEvent, UploadTag},
        shutdown::ShutdownSignal,
        state::{HandshakeBits, HandshakeTransition, Measurement, PendingAck, StationState, Verdict},
    },
    protocol::transport::{RegisterTransport, TransportError},
};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("shutdown requested")]
    Cancelled,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub transition: HandshakeTransition,
    /// Set when a request was acknowledged this cycle
    pub verdict: Option<Verdict>,
    /// Set when MES was consulted (or the upload was refused locally)
    pub upload: Option<UploadOutcome>,
    /// The verdict came from a parked acknowledgment
    pub replayed: bool,
}

impl CycleOutcome {
    fn idle(transition: HandshakeTransition) -> Self {
        Self {
            transition,
            verdict: None,
            upload: None,
            replayed: false,
        }
    }
}

pub type CycleResult = Result<CycleOutcome, CycleError>;

/// Failed branch, possibly carrying a verdict that must survive the failure.
struct BranchFailure {
    error: CycleError,
    park: Option<PendingAck>,
}

impl From<CycleError> for BranchFailure {
    fn from(error: CycleError) -> Self {
        Self { error, park: None }
    }
}

impl From<TransportError> for BranchFailure {
    fn from(error: TransportError) -> Self {
        CycleError::from(error).into()
    }
}

/// Result of the quality path for one unit.
struct Decision {
    verdict: Verdict,
    upload: Option<UploadOutcome>,
    measurements: Vec<Measurement>,
    replayed: bool,
}

pub struct HandshakeEngine {
    sink: Arc<dyn LogSink>,
    shutdown: Option<ShutdownSignal>,
}

impl HandshakeEngine {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            shutdown: None,
        }
    }

    /// Abandon cycles at the next read once `signal` fires.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn run_once(
        &self,
        config: &StationConfig,
        state: &mut StationState,
        transport: &mut dyn RegisterTransport,
        reporter: &dyn MesReporter,
    ) -> CycleResult {
        let bits = self.read_bits(config, transport)?;
        let transition = HandshakeTransition::detect(bits.request, bits.response);
        let mut next = state.clone();
        next.bits = bits;

        if bits.ok && bits.ng {
            if !state.invariant_flagged {
                self.emit(
                    config,
                    EventKind::InvariantViolation {
                        detail: "Ok and Ng are both set".to_string(),
                    },
                );
            }
            next.invariant_flagged = true;
            next.verdict = Some(Verdict::Ng);
        } else {
            next.invariant_flagged = false;
        }

        let branch = match transition {
            HandshakeTransition::RequestRising => {
                self.acknowledge(config, &mut next, transport, reporter)
            }
            HandshakeTransition::RequestFalling => self.reset(config, &mut next, transport),
            HandshakeTransition::NoChange => Ok(CycleOutcome::idle(transition)),
        };

        match branch {
            Ok(outcome) => {
                next.cycles += 1;
                next.last_success = Some(Local::now());
                *state = next;
                Ok(outcome)
            }
            Err(BranchFailure { error, park }) => {
                if let Some(pending) = park {
                    log::warn!(
                        "[{}] acknowledgment for '{}' not written, parking {} verdict",
                        config.id,
                        pending.serial,
                        pending.verdict
                    );
                    state.pending = Some(pending);
                }
                Err(error)
            }
        }
    }

    fn ensure_running(&self) -> Result<(), CycleError> {
        if self.shutdown.as_ref().is_some_and(|s| s.is_triggered()) {
            return Err(CycleError::Cancelled);
        }
        Ok(())
    }

    fn read_bool(
        &self,
        transport: &mut dyn RegisterTransport,
        address: &RegisterAddress,
    ) -> Result<bool, CycleError> {
        self.ensure_running()?;
        Ok(transport.read_bool(address)?)
    }

    fn read_string(
        &self,
        transport: &mut dyn RegisterTransport,
        binding: &TextBinding,
    ) -> Result<String, CycleError> {
        self.ensure_running()?;
        Ok(transport.read_string(&binding.address, binding.max_len, binding.layout)?)
    }

    fn emit(&self, config: &StationConfig, kind: EventKind) {
        self.sink.record(StationEvent::new(config.id.as_str(), kind));
    }

    fn acknowledge(
        &self,
        config: &StationConfig,
        next: &mut StationState,
        transport: &mut dyn RegisterTransport,
        reporter: &dyn MesReporter,
    ) -> Result<CycleOutcome, BranchFailure> {
        let serial = match &config.serial {
            Some(binding) => self.read_string(transport, binding)?,
            None => String::new(),
        };

        let decision = match next.pending.as_ref().filter(|p| p.serial == serial) {
            Some(pending) => Decision {
                verdict: pending.verdict,
                upload: pending.upload.clone(),
                measurements: pending.measurements.clone(),
                replayed: true,
            },
            None => self.decide(config, &serial, transport, reporter)?,
        };

        if let Err(error) = write_acknowledgment(config, transport, decision.verdict) {
            // Only a verdict that cost an upload is worth keeping.
            let park = (decision.replayed || decision.upload.is_some()).then(|| PendingAck {
                serial: serial.clone(),
                verdict: decision.verdict,
                upload: decision.upload.clone(),
                measurements: decision.measurements.clone(),
                since: Local::now(),
            });
            return Err(BranchFailure {
                error: error.into(),
                park,
            });
        }

        next.bits.ok = decision.verdict == Verdict::Ok;
        next.bits.ng = decision.verdict == Verdict::Ng;
        next.bits.response = true;
        next.invariant_flagged = false;
        next.serial = Some(serial.clone());
        next.measurements = decision.measurements;
        next.verdict = Some(decision.verdict);
        next.pending = None;

        let upload_tag = decision
            .upload
            .as_ref()
            .map_or(UploadTag::Skipped, UploadOutcome::tag);
        self.emit(
            config,
            EventKind::RequestProcessed {
                serial,
                verdict: decision.verdict,
                upload: upload_tag,
                detail: decision
                    .upload
                    .as_ref()
                    .and_then(|u| u.detail())
                    .map(str::to_string),
                replayed: decision.replayed,
            },
        );

        Ok(CycleOutcome {
            transition: HandshakeTransition::RequestRising,
            verdict: Some(decision.verdict),
            upload: decision.upload,
            replayed: decision.replayed,
        })
    }

    fn reset(
        &self,
        config: &StationConfig,
        next: &mut StationState,
        transport: &mut dyn RegisterTransport,
    ) -> Result<CycleOutcome, BranchFailure> {
        transport.write_bool(&config.signals.ok, false)?;
        transport.write_bool(&config.signals.ng, false)?;
        transport.write_bool(&config.signals.response, false)?;

        next.bits.ok = false;
        next.bits.ng = false;
        next.bits.response = false;
        next.invariant_flagged = false;
        self.emit(config, EventKind::RequestReset);

        Ok(CycleOutcome::idle(HandshakeTransition::RequestFalling))
    }

    fn read_bits(
        &self,
        config: &StationConfig,
        transport: &mut dyn RegisterTransport,
    ) -> Result<HandshakeBits, CycleError> {
        let signals = &config.signals;
        Ok(HandshakeBits {
            request: self.read_bool(transport, &signals.request)?,
            response: self.read_bool(transport, &signals.response)?,
            ok: self.read_bool(transport, &signals.ok)?,
            ng: self.read_bool(transport, &signals.ng)?,
        })
    }

    fn read_measurements(
        &self,
        config: &StationConfig,
        transport: &mut dyn RegisterTransport,
    ) -> Result<Vec<Measurement>, CycleError> {
        let mut measurements = Vec::with_capacity(config.measurements.len());
        for binding in &config.measurements {
            let (value, pass) = match &binding.source {
                MeasurementSource::Bit(address) => {
                    let set = self.read_bool(transport, address)?;
                    (if set { 1.0 } else { 0.0 }, set)
                }
                MeasurementSource::Text(text) => {
                    let raw = self.read_string(transport, text)?;
                    let value = raw.parse::<f64>().unwrap_or_else(|_| {
                        log::warn!(
                            "[{}] measurement '{}' is not a number: '{raw}'",
                            config.id,
                            binding.key
                        );
                        f64::NAN
                    });
                    (value, binding.within_limits(value))
                }
            };
            measurements.push(Measurement {
                key: binding.key.clone(),
                value,
                unit: binding.unit.clone(),
                lower: binding.lower,
                upper: binding.upper,
                pass,
            });
        }
        Ok(measurements)
    }

    /// Read the payload and run the quality path for a fresh unit.
    fn decide(
        &self,
        config: &StationConfig,
        serial: &str,
        transport: &mut dyn RegisterTransport,
        reporter: &dyn MesReporter,
    ) -> Result<Decision, CycleError> {
        let mut aux_pass = true;
        for address in &config.aux_pass {
            aux_pass &= self.read_bool(transport, address)?;
        }
        let measurements = self.read_measurements(config, transport)?;
        let local = if aux_pass && measurements.iter().all(|m| m.pass) {
            TestResult::Pass
        } else {
            TestResult::Fail
        };

        let upload = match config.quality_check {
            QualityCheck::None => None,
            QualityCheck::Mes => {
                self.ensure_running()?;
                Some(
                    match UploadRequest::new(config, serial, local, measurements.clone()) {
                        Ok(request) => reporter.upload(&request),
                        Err(err) => UploadOutcome::Rejected(err.to_string()),
                    },
                )
            }
        };

        let passed = match &upload {
            None => true,
            Some(outcome) => *outcome == UploadOutcome::Success && local == TestResult::Pass,
        };

        Ok(Decision {
            verdict: if passed { Verdict::Ok } else { Verdict::Ng },
            upload,
            measurements,
            replayed: false,
        })
    }
}

/// Write Ok/Ng (cleared bit first) and then raise Response.
fn write_acknowledgment(
    config: &StationConfig,
    transport: &mut dyn RegisterTransport,
    verdict: Verdict,
) -> Result<(), TransportError> {
    let signals = &config.signals;
    let (set, clear) = match verdict {
        Verdict::Ok => (&signals.ok, &signals.ng),
        Verdict::Ng => (&signals.ng, &signals.ok),
    };
    transport.write_bool(clear, false)?;
    transport.write_bool(set, true)?;
    transport.write_bool(&signals.response, true)
}
