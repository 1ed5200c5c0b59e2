use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use serde::Serialize;
use std::sync::Arc;

use crate::{
    api::{
        reporter::{HttpMesReporter, MesReporter, NullReporter},
        scheduler::{PollingScheduler, SchedulerDeps},
        status::{self, StatusState},
        traits::{BufferSink, FanoutSink, LogSink, LoggingSink},
    },
    cli::config::{AppConfig, StationConfig},
    core::{
        pool::{ConnectionPool, LinkHandle},
        state::{HandshakeBits, StateBoard},
    },
    protocol::transport::{
        RegisterTransport, TransportError, TransportFactory, WireTransportFactory,
    },
};

/// Load the configuration named on the command line.
pub fn load_config(matches: &ArgMatches) -> Result<AppConfig> {
    let path = matches
        .get_one::<String>("config")
        .context("missing --config")?;
    let mut config =
        AppConfig::from_file(path).with_context(|| format!("Failed to load config '{path}'"))?;

    if let Some(wanted) = matches.get_many::<String>("station") {
        let wanted = wanted.cloned().collect::<Vec<_>>();
        if let Some(missing) = wanted
            .iter()
            .find(|id| !config.stations.iter().any(|s| &s.id == *id))
        {
            bail!("Station '{missing}' is not defined in '{path}'");
        }
        config.stations.retain(|s| wanted.contains(&s.id));
    }
    Ok(config)
}

#[derive(Debug, Serialize)]
struct CheckSummary<'a> {
    valid: bool,
    links: Vec<&'a str>,
    stations: Vec<&'a str>,
    mes: bool,
    status_listen: Option<&'a str>,
}

/// Print a summary of an already validated configuration.
pub fn print_check(config: &AppConfig, json: bool) -> Result<()> {
    let summary = CheckSummary {
        valid: true,
        links: config.links.iter().map(|l| l.id.as_str()).collect(),
        stations: config.stations.iter().map(|s| s.id.as_str()).collect(),
        mes: config.mes.is_some(),
        status_listen: config.status.as_ref().map(|s| s.listen.as_str()),
    };
    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!(
            "Configuration OK: {} link(s), {} station(s), MES {}",
            summary.links.len(),
            summary.stations.len(),
            if summary.mes { "enabled" } else { "disabled" }
        );
        for station in &config.stations {
            println!(
                "  {} -> {} ({:?} quality check)",
                station.id, station.link, station.quality_check
            );
        }
    }
    Ok(())
}

/// Read-only view of one station at probe time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub station: String,
    pub link: String,
    pub bits: Option<HandshakeBits>,
    pub serial: Option<String>,
    pub error: Option<String>,
}

fn probe_station(
    station: &StationConfig,
    transport: &mut dyn RegisterTransport,
) -> Result<(HandshakeBits, Option<String>), TransportError> {
    let signals = &station.signals;
    let bits = HandshakeBits {
        request: transport.read_bool(&signals.request)?,
        response: transport.read_bool(&signals.response)?,
        ok: transport.read_bool(&signals.ok)?,
        ng: transport.read_bool(&signals.ng)?,
    };
    let serial = match &station.serial {
        Some(binding) => Some(transport.read_string(
            &binding.address,
            binding.max_len,
            binding.layout,
        )?),
        None => None,
    };
    Ok((bits, serial))
}

/// Read every station once without writing anything.
pub fn probe_stations(config: &AppConfig, factory: Arc<dyn TransportFactory>) -> Vec<ProbeReport> {
    let pool = ConnectionPool::new(factory, config.reconnect.clone());
    let reports = config
        .stations
        .iter()
        .map(|station| {
            let mut report = ProbeReport {
                station: station.id.clone(),
                link: station.link.clone(),
                bits: None,
                serial: None,
                error: None,
            };
            let Some(link) = config.link(&station.link) else {
                report.error = Some(format!("unknown link '{}'", station.link));
                return report;
            };
            let mut transport = LinkHandle::new(pool.acquire(link));
            match probe_station(station, &mut transport) {
                Ok((bits, serial)) => {
                    report.bits = Some(bits);
                    report.serial = serial;
                }
                Err(err) => report.error = Some(err.to_string()),
            }
            report
        })
        .collect();
    pool.close_all();
    reports
}

pub fn print_probe(reports: &[ProbeReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(reports)?);
        return Ok(());
    }
    for report in reports {
        match (&report.bits, &report.error) {
            (Some(bits), _) => println!(
                "{} [{}] request={} response={} ok={} ng={} serial={}",
                report.station,
                report.link,
                bits.request,
                bits.response,
                bits.ok,
                bits.ng,
                report.serial.as_deref().unwrap_or("-")
            ),
            (None, Some(err)) => println!("{} [{}] error: {err}", report.station, report.link),
            (None, None) => println!("{} [{}] no data", report.station, report.link),
        }
    }
    Ok(())
}

/// Run every configured station until Ctrl-C.
pub async fn run_daemon(config: AppConfig) -> Result<()> {
    if config.stations.is_empty() {
        bail!("No stations configured");
    }

    let board = Arc::new(StateBoard::new());
    let events = BufferSink::new(config.scheduler.event_buffer);
    let sink: Arc<dyn LogSink> = Arc::new(FanoutSink::new(vec![
        Arc::new(LoggingSink),
        Arc::new(events.clone()),
    ]));
    let reporter: Arc<dyn MesReporter> = match &config.mes {
        Some(mes) => {
            log::info!("MES uploads go to {}", mes.endpoint);
            Arc::new(HttpMesReporter::new(mes))
        }
        None => Arc::new(NullReporter),
    };
    let pool = Arc::new(ConnectionPool::new(
        Arc::new(WireTransportFactory),
        config.reconnect.clone(),
    ));

    let stations = config
        .stations
        .iter()
        .cloned()
        .map(Arc::new)
        .collect::<Vec<_>>();
    let scheduler = PollingScheduler::start(
        stations,
        SchedulerDeps {
            settings: config.scheduler.clone(),
            links: config.links.clone(),
            pool,
            reporter,
            sink,
            board: Arc::clone(&board),
        },
    )?;

    let (status_tx, status_rx) = flume::bounded::<()>(1);
    let status_task = config.status.as_ref().map(|settings| {
        let listen = settings.listen.clone();
        let state = StatusState { board, events };
        tokio::spawn(async move {
            if let Err(err) = status::serve(&listen, state, status_rx).await {
                log::error!("{err:#}");
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutdown requested");

    let report = scheduler.stop().await;
    drop(status_tx);
    if let Some(task) = status_task {
        let _ = task.await;
    }
    if !report.timed_out.is_empty() {
        log::warn!("Stations still busy at exit: {}", report.timed_out.join(", "));
    }
    Ok(())
}
