use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use stationlink_protocol::{Protocol, RegisterAddress, TextLayout};

use crate::{
    cli::config::{LinkConfig, LinkProtocol, ReconnectPolicy},
    protocol::transport::{RegisterTransport, TransportError, TransportFactory},
};

/// Physical identity of a PLC connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Rack/slot for S7, unit id for Modbus
    pub endpoint: (u16, u16),
}

impl LinkKey {
    pub fn of(link: &LinkConfig) -> Self {
        let endpoint = match link.protocol {
            LinkProtocol::S7 { rack, slot } => (rack, slot),
            LinkProtocol::Modbus { unit_id, .. } => (u16::from(unit_id), 0),
        };
        Self {
            protocol: link.protocol(),
            host: link.host.trim().to_ascii_lowercase(),
            port: link.port(),
            endpoint,
        }
    }
}

pub fn build_exponential_backoff(policy: &ReconnectPolicy) -> ExponentialBackoff {
    let initial_interval = Duration::from_millis(policy.initial_interval_ms.max(1));
    ExponentialBackoff {
        current_interval: initial_interval,
        initial_interval,
        max_interval: Duration::from_millis(policy.max_interval_ms.max(policy.initial_interval_ms)),
        randomization_factor: policy.randomization_factor.clamp(0.0, 1.0),
        multiplier: policy.multiplier.max(1.0),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

struct LinkSlot {
    transport: Box<dyn RegisterTransport>,
    backoff: Option<ExponentialBackoff>,
    retry_at: Option<Instant>,
}

/// One physical connection shared by every station on it.
///
/// The mutex serializes each register call; stations keep their own cadence.
pub struct SharedLink {
    label: String,
    policy: ReconnectPolicy,
    slot: Mutex<LinkSlot>,
    closed: AtomicBool,
}

impl SharedLink {
    pub fn new(
        label: impl Into<String>,
        transport: Box<dyn RegisterTransport>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            label: label.into(),
            policy,
            slot: Mutex::new(LinkSlot {
                transport,
                backoff: None,
                retry_at: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_connected(&self) -> bool {
        self.slot.lock().transport.is_connected()
    }

    pub fn disconnect(&self) {
        self.slot.lock().transport.disconnect();
    }

    /// Disconnect for good; every later call fails with [`TransportError::Closed`].
    ///
    /// Blocks until a call already holding the link has returned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnect();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `f` against a connected transport, connecting first if needed.
    ///
    /// While a reconnect is backing off this returns
    /// [`TransportError::Backoff`] without touching the network.
    pub fn with_transport<T>(
        &self,
        f: impl FnOnce(&mut dyn RegisterTransport) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut slot = self.slot.lock();
        self.ensure_connected(&mut slot)?;
        f(slot.transport.as_mut())
    }

    fn ensure_connected(&self, slot: &mut LinkSlot) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if slot.transport.is_connected() {
            return Ok(());
        }
        if let Some(retry_at) = slot.retry_at {
            let now = Instant::now();
            if now < retry_at {
                return Err(TransportError::Backoff(retry_at - now));
            }
        }

        match slot.transport.connect() {
            Ok(()) => {
                slot.backoff = None;
                slot.retry_at = None;
                Ok(())
            }
            Err(err) => {
                let policy = &self.policy;
                let delay = slot
                    .backoff
                    .get_or_insert_with(|| build_exponential_backoff(policy))
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(policy.max_interval_ms));
                slot.retry_at = Some(Instant::now() + delay);
                log::warn!(
                    "Link {} connect failed, retrying in {}ms: {err}",
                    self.label,
                    delay.as_millis()
                );
                Err(err)
            }
        }
    }
}

/// [`RegisterTransport`] view of a shared link handed to one station.
#[derive(Clone)]
pub struct LinkHandle {
    link: Arc<SharedLink>,
}

impl LinkHandle {
    pub fn new(link: Arc<SharedLink>) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &Arc<SharedLink> {
        &self.link
    }
}

impl RegisterTransport for LinkHandle {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.link.with_transport(|_| Ok(()))
    }

    fn disconnect(&mut self) {
        self.link.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn read_bool(&mut self, address: &RegisterAddress) -> Result<bool, TransportError> {
        self.link.with_transport(|t| t.read_bool(address))
    }

    fn read_string(
        &mut self,
        address: &RegisterAddress,
        max_len: usize,
        layout: TextLayout,
    ) -> Result<String, TransportError> {
        self.link
            .with_transport(|t| t.read_string(address, max_len, layout))
    }

    fn write_bool(&mut self, address: &RegisterAddress, value: bool) -> Result<(), TransportError> {
        self.link.with_transport(|t| t.write_bool(address, value))
    }
}

/// Shared links keyed by physical identity.
pub struct ConnectionPool {
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    links: Mutex<HashMap<LinkKey, Arc<SharedLink>>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn TransportFactory>, policy: ReconnectPolicy) -> Self {
        Self {
            factory,
            policy,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Shared link for `link`, created on first use.
    pub fn acquire(&self, link: &LinkConfig) -> Arc<SharedLink> {
        let key = LinkKey::of(link);
        let mut links = self.links.lock();
        Arc::clone(links.entry(key).or_insert_with(|| {
            log::debug!("Opening shared link {} for '{}'", link.endpoint(), link.id);
            Arc::new(SharedLink::new(
                link.endpoint(),
                self.factory.create(link),
                self.policy.clone(),
            ))
        }))
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    /// Close every pooled link; blocks on links in use.
    pub fn close_all(&self) {
        let links = self.links.lock().values().cloned().collect::<Vec<_>>();
        for link in links {
            link.close();
            log::debug!("Closed link {}", link.label());
        }
    }
}
