use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use thiserror::Error;

use crate::{
    cli::config::{MesSettings, StationConfig},
    core::{logs::UploadTag, state::Measurement},
};

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("serial number is empty")]
    EmptySerial,
    #[error("MES request failed: {0}")]
    Http(#[from] ureq::Error),
}

/// Local test result sent along with the measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TestResult {
    Pass,
    Fail,
}

/// Payload of one MES upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    serial_number: String,
    resource_code: String,
    station_code: String,
    work_order_code: String,
    test_result: TestResult,
    measurements: Vec<Measurement>,
}

impl UploadRequest {
    pub fn new(
        station: &StationConfig,
        serial: &str,
        test_result: TestResult,
        measurements: Vec<Measurement>,
    ) -> Result<Self, ReporterError> {
        let serial = serial.trim();
        if serial.is_empty() {
            return Err(ReporterError::EmptySerial);
        }
        Ok(Self {
            serial_number: serial.to_string(),
            resource_code: station.resource_code.clone(),
            station_code: station.station_code.clone(),
            work_order_code: station.work_order_code.clone(),
            test_result,
            measurements,
        })
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn test_result(&self) -> TestResult {
        self.test_result
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }
}

/// Classified result of an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Success,
    /// MES answered and refused the unit
    Rejected(String),
    /// MES could not be reached or answered garbage
    TransportFailure(String),
}

impl UploadOutcome {
    pub fn tag(&self) -> UploadTag {
        match self {
            UploadOutcome::Success => UploadTag::Accepted,
            UploadOutcome::Rejected(_) => UploadTag::Rejected,
            UploadOutcome::TransportFailure(_) => UploadTag::UploadFailed,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            UploadOutcome::Success => None,
            UploadOutcome::Rejected(msg) | UploadOutcome::TransportFailure(msg) => Some(msg),
        }
    }
}

/// Uploads a unit's result to the MES.
///
/// Implementations never retry internally; the handshake decides what a
/// failed upload means.
pub trait MesReporter: Send + Sync {
    fn upload(&self, request: &UploadRequest) -> UploadOutcome;
}

/// Accepts everything without a network call
pub struct NullReporter;

impl MesReporter for NullReporter {
    fn upload(&self, request: &UploadRequest) -> UploadOutcome {
        log::debug!("MES disabled, accepting {}", request.serial_number);
        UploadOutcome::Success
    }
}

#[derive(Debug, Deserialize)]
struct MesResponse {
    #[serde(alias = "Code", alias = "status")]
    code: i64,
    #[serde(default, alias = "Message", alias = "msg")]
    message: Option<String>,
}

/// JSON-over-HTTP MES client.
pub struct HttpMesReporter {
    agent: ureq::Agent,
    endpoint: String,
    token: Option<String>,
}

impl HttpMesReporter {
    pub fn new(settings: &MesSettings) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_millis(settings.timeout_ms.max(1))))
            .build()
            .into();
        Self {
            agent,
            endpoint: settings.endpoint.clone(),
            token: settings.token.clone(),
        }
    }

    fn post(&self, request: &UploadRequest) -> Result<MesResponse, ReporterError> {
        let mut builder = self.agent.post(&self.endpoint);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let mut response = builder.send_json(request)?;
        Ok(response.body_mut().read_json::<MesResponse>()?)
    }
}

impl MesReporter for HttpMesReporter {
    fn upload(&self, request: &UploadRequest) -> UploadOutcome {
        match self.post(request) {
            Ok(MesResponse { code: 0, .. }) => UploadOutcome::Success,
            Ok(MesResponse { code, message }) => UploadOutcome::Rejected(
                message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| format!("MES returned code {code}")),
            ),
            Err(err) => {
                log::warn!("MES upload for {} failed: {err}", request.serial_number);
                UploadOutcome::TransportFailure(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{HandshakeSignals, QualityCheck};

    fn station() -> StationConfig {
        StationConfig {
            id: "op10".to_string(),
            link: "plc".to_string(),
            resource_code: "R-10".to_string(),
            station_code: "OP10".to_string(),
            work_order_code: "WO-7".to_string(),
            poll_interval_ms: None,
            quality_check: QualityCheck::Mes,
            signals: HandshakeSignals {
                request: "DB1.DBX0.0".parse().unwrap(),
                response: "DB1.DBX0.1".parse().unwrap(),
                ok: "DB1.DBX0.2".parse().unwrap(),
                ng: "DB1.DBX0.3".parse().unwrap(),
            },
            serial: None,
            aux_pass: Vec::new(),
            measurements: Vec::new(),
        }
    }

    #[test]
    fn test_upload_request_trims_and_rejects_empty_serial() {
        let request = UploadRequest::new(&station(), "  SN-1 ", TestResult::Pass, Vec::new()).unwrap();
        assert_eq!(request.serial_number(), "SN-1");
        assert!(matches!(
            UploadRequest::new(&station(), " \t", TestResult::Pass, Vec::new()),
            Err(ReporterError::EmptySerial)
        ));
    }

    #[test]
    fn test_upload_request_json_shape() {
        let measurement = Measurement {
            key: "torque".to_string(),
            value: 2.0,
            unit: "Nm".to_string(),
            lower: Some(1.5),
            upper: None,
            pass: true,
        };
        let request =
            UploadRequest::new(&station(), "SN-1", TestResult::Fail, vec![measurement]).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["serialNumber"], "SN-1");
        assert_eq!(json["resourceCode"], "R-10");
        assert_eq!(json["workOrderCode"], "WO-7");
        assert_eq!(json["testResult"], "FAIL");
        assert_eq!(json["measurements"][0]["key"], "torque");
    }

    #[test]
    fn test_outcome_tags() {
        assert_eq!(UploadOutcome::Success.tag(), UploadTag::Accepted);
        assert_eq!(
            UploadOutcome::Rejected("bad".to_string()).detail(),
            Some("bad")
        );
        assert_eq!(
            UploadOutcome::TransportFailure("down".to_string()).tag(),
            UploadTag::UploadFailed
        );
    }

    #[test]
    fn test_unreachable_endpoint_is_transport_failure() {
        let reporter = HttpMesReporter::new(&MesSettings {
            endpoint: "http://127.0.0.1:1/upload".to_string(),
            timeout_ms: 500,
            token: None,
        });
        let request = UploadRequest::new(&station(), "SN-1", TestResult::Pass, Vec::new()).unwrap();
        assert!(matches!(
            reporter.upload(&request),
            UploadOutcome::TransportFailure(_)
        ));
    }
}
