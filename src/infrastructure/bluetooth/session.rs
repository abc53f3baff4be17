//! GATT Session
//!
//! Owns the link to one peripheral and drives the connection state machine:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──Connected──▶ Connected ──ServicesDiscovered──▶ ServicesDiscovered
//!       ▲                          │                        │                                   │
//!       └──────── disconnect() / link loss / connect timeout ┴───────────────────────────────────┘
//! ```
//!
//! Transitions from the caller side (`connect`, `disconnect`, ...) and from the
//! transport side ([`GattSession::handle_transport_event`]) go through the same
//! mutex, so a write started after a `Disconnected` event always sees the
//! cleared descriptor set. Every transition is broadcast to subscribers after
//! it has been applied.

use crate::domain::error::{GattError, Result};
use crate::domain::models::{
    CharacteristicDescriptor, PeripheralIdentity, ServiceDescriptor, SessionEvent, SessionState,
};
use crate::domain::settings::SessionConfig;
use crate::infrastructure::bluetooth::protocol::{
    self, UNKNOWN_CHARACTERISTIC, UNKNOWN_SERVICE,
};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredService, GattTransport, LinkAttempt, TransportEvent, TransportEventReceiver,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct SessionInner {
    state: SessionState,
    peripheral: Option<PeripheralIdentity>,
    services: Vec<ServiceDescriptor>,
    notifying: Option<CharacteristicDescriptor>,
    /// Bumped on every connect and teardown so stale timeouts and link events
    /// can be recognised
    attempt: u64,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            peripheral: None,
            services: Vec::new(),
            notifying: None,
            attempt: 0,
        }
    }

    fn is_current(&self, attempt: LinkAttempt) -> bool {
        attempt.0 == self.attempt
    }

    fn find(&self, service: &Uuid, characteristic: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.services
            .iter()
            .filter(|s| s.uuid == *service)
            .find_map(|s| s.characteristic(characteristic))
    }

    /// Resolve against the current discovered set
    fn lookup(&self, service: &Uuid, characteristic: &Uuid) -> Result<&CharacteristicDescriptor> {
        if self.state != SessionState::ServicesDiscovered {
            return Err(GattError::DiscoveryIncomplete);
        }
        self.find(service, characteristic)
            .ok_or(GattError::NotFound {
                service: *service,
                characteristic: *characteristic,
            })
    }
}

#[derive(Clone)]
pub struct GattSession {
    transport: Arc<dyn GattTransport>,
    inner: Arc<Mutex<SessionInner>>,
    events: broadcast::Sender<SessionEvent>,
    state_tx: Arc<watch::Sender<SessionState>>,
    config: SessionConfig,
}

impl GattSession {
    pub fn new(transport: Arc<dyn GattTransport>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        Self {
            transport,
            inner: Arc::new(Mutex::new(SessionInner::new())),
            events,
            state_tx: Arc::new(state_tx),
            config,
        }
    }

    /// New receiver for session events. Each subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Receiver that always holds the latest state, including `Connecting`
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Peripheral the session is bound to, if any
    pub fn peripheral(&self) -> Option<PeripheralIdentity> {
        self.lock().peripheral.clone()
    }

    /// Discovered services; empty unless the state is `ServicesDiscovered`
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.lock().services.clone()
    }

    pub fn find_characteristic(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Option<CharacteristicDescriptor> {
        self.lock().find(service, characteristic).cloned()
    }

    /// First discovered characteristic with the given UUID, in discovery order
    pub fn characteristic_by_uuid(&self, uuid: &Uuid) -> Option<CharacteristicDescriptor> {
        self.lock()
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *uuid)
            .cloned()
    }

    pub fn active_notification(&self) -> Option<CharacteristicDescriptor> {
        self.lock().notifying.clone()
    }

    /// Request a link to `peripheral`.
    ///
    /// Returns the state right after the request. The outcome arrives later as a
    /// `Connected` or `Disconnected` event. Asking again for the peripheral the
    /// session is already bound to changes nothing; asking for another one tears
    /// the current link down first.
    pub fn connect(&self, peripheral: impl Into<PeripheralIdentity>) -> SessionState {
        let target = peripheral.into();
        let mut inner = self.lock();

        if inner.state != SessionState::Disconnected {
            if let Some(current) = &inner.peripheral {
                if current.same_address(&target) {
                    debug!("Already {} to {}", inner.state, current);
                    return inner.state;
                }
                info!("Switching peripheral from {} to {}", current, target);
            }
            if let Err(e) = self.transport.disconnect() {
                warn!("Teardown request failed: {:#}", e);
            }
            self.enter_disconnected(&mut inner, None);
        }

        info!("Connecting to {}", target);
        inner.attempt += 1;
        let attempt = inner.attempt;
        let address = target.address().to_string();
        inner.peripheral = Some(target);
        self.set_state(&mut inner, SessionState::Connecting);

        if let Err(e) = self.transport.connect(&address, LinkAttempt(attempt)) {
            self.enter_disconnected(&mut inner, Some(GattError::Transport(e)));
            return inner.state;
        }

        if let Some(timeout) = self.config.connect_timeout {
            self.arm_connect_timeout(attempt, timeout);
        }

        inner.state
    }

    /// Tear the link down. No-op when already disconnected.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Disconnected {
            debug!("Disconnect requested while already disconnected");
            return;
        }

        if let Err(e) = self.transport.disconnect() {
            warn!("Disconnect request failed: {:#}", e);
        }
        self.enter_disconnected(&mut inner, None);
    }

    /// Start service discovery. Completion is reported by a `ServicesDiscovered` event.
    pub fn discover_services(&self) -> Result<()> {
        let inner = self.lock();
        match inner.state {
            SessionState::Connected => {
                info!("Discovering services...");
                self.transport.discover_services()?;
                Ok(())
            }
            SessionState::ServicesDiscovered => {
                debug!("Services already discovered");
                Ok(())
            }
            SessionState::Disconnected | SessionState::Connecting => Err(GattError::NotConnected),
        }
    }

    /// Request a read. The value arrives as a `DataAvailable` event.
    pub fn read_characteristic(&self, descriptor: &CharacteristicDescriptor) -> Result<()> {
        let inner = self.lock();
        let current = inner.lookup(&descriptor.service_uuid, &descriptor.uuid)?;
        if !current.properties.is_readable() {
            return Err(GattError::NotReadable(current.uuid));
        }

        debug!("Reading {}", current.name);
        self.transport.read_characteristic(current.handle)?;
        Ok(())
    }

    /// Enable or disable notifications on one characteristic.
    ///
    /// Only one subscription is kept: enabling a characteristic disables the
    /// previously active one first.
    pub fn set_notification(
        &self,
        descriptor: &CharacteristicDescriptor,
        enabled: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        let target = inner
            .lookup(&descriptor.service_uuid, &descriptor.uuid)?
            .clone();
        if !target.properties.is_notifiable() {
            return Err(GattError::NotNotifiable(target.uuid));
        }

        let is_active = inner
            .notifying
            .as_ref()
            .is_some_and(|active| active.handle == target.handle);

        if enabled {
            if is_active {
                debug!("Notifications already enabled on {}", target.name);
                return Ok(());
            }
            if let Some(previous) = inner.notifying.take() {
                info!("Disabling notifications on {}", previous.name);
                if let Err(e) = self.transport.set_notify(previous.handle, false) {
                    warn!("Failed to disable notifications on {}: {:#}", previous.name, e);
                }
            }
            info!("Enabling notifications on {}", target.name);
            self.transport.set_notify(target.handle, true)?;
            inner.notifying = Some(target);
        } else if is_active {
            info!("Disabling notifications on {}", target.name);
            inner.notifying = None;
            self.transport.set_notify(target.handle, false)?;
        } else {
            debug!("Notifications not active on {}", target.name);
        }

        Ok(())
    }

    /// Write `payload` to a characteristic of the discovered profile.
    ///
    /// Fails with `NotFound` for a pair that is neither part of the bot profile
    /// nor discovered, whatever the state. The write itself is fire-and-forget.
    pub fn write(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        let inner = self.lock();
        let known = protocol::is_profile_characteristic(&service, &characteristic)
            || inner.find(&service, &characteristic).is_some();
        if !known {
            return Err(GattError::NotFound {
                service,
                characteristic,
            });
        }

        let target = inner.lookup(&service, &characteristic)?;
        if !target.properties.is_writable() {
            return Err(GattError::NotWritable(target.uuid));
        }

        debug!("Writing {:02X?} to {}", payload, target.name);
        self.transport.write_characteristic(target.handle, payload)?;
        Ok(())
    }

    /// Apply one event from the transport.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        let mut inner = self.lock();
        let state = inner.state;

        match event {
            TransportEvent::Connected(attempt) => match state {
                SessionState::Disconnected => {
                    warn!("Link came up after the attempt was abandoned, tearing it down");
                    if let Err(e) = self.transport.disconnect() {
                        warn!("Teardown request failed: {:#}", e);
                    }
                }
                _ if !inner.is_current(attempt) => {
                    debug!("Ignoring link-up from abandoned attempt {}", attempt.0);
                }
                SessionState::Connecting => {
                    self.set_state(&mut inner, SessionState::Connected);
                    self.emit(SessionEvent::Connected);
                    if self.config.auto_discover_services {
                        info!("Discovering services...");
                        if let Err(e) = self.transport.discover_services() {
                            warn!("Service discovery request failed: {:#}", e);
                        }
                    }
                }
                SessionState::Connected | SessionState::ServicesDiscovered => {
                    debug!("Duplicate connected event ignored");
                }
            },

            TransportEvent::Disconnected(attempt) => match state {
                SessionState::Disconnected => debug!("Already disconnected"),
                _ if !inner.is_current(attempt) => {
                    debug!("Ignoring link-down from abandoned attempt {}", attempt.0);
                }
                SessionState::Connecting => {
                    info!("Connection attempt failed");
                    self.enter_disconnected(&mut inner, None);
                }
                SessionState::Connected | SessionState::ServicesDiscovered => {
                    self.enter_disconnected(&mut inner, Some(GattError::ConnectionLost));
                }
            },

            TransportEvent::ServicesDiscovered(services) => {
                if inner.state != SessionState::Connected {
                    warn!("Discovery result ignored in state {}", inner.state);
                    return;
                }
                inner.services = describe(services);
                info!(
                    "Discovered {} services, {} characteristics",
                    inner.services.len(),
                    inner
                        .services
                        .iter()
                        .map(|s| s.characteristics.len())
                        .sum::<usize>()
                );
                self.set_state(&mut inner, SessionState::ServicesDiscovered);
                self.emit(SessionEvent::ServicesDiscovered);
            }

            TransportEvent::DataAvailable {
                characteristic,
                value,
            } => {
                if inner.state != SessionState::ServicesDiscovered {
                    debug!("Data ignored in state {}", inner.state);
                    return;
                }

                let descriptor = match characteristic {
                    Some(uuid) => inner
                        .notifying
                        .clone()
                        .filter(|active| active.uuid == uuid)
                        .or_else(|| {
                            inner
                                .services
                                .iter()
                                .flat_map(|s| s.characteristics.iter())
                                .find(|c| c.uuid == uuid)
                                .cloned()
                        }),
                    None => inner.notifying.clone(),
                };

                match descriptor {
                    Some(characteristic) => {
                        trace!("Data from {}: {:02X?}", characteristic.name, value);
                        self.emit(SessionEvent::DataAvailable {
                            characteristic,
                            value,
                        });
                    }
                    None => warn!("Dropping data for unknown characteristic {:?}", characteristic),
                }
            }
        }
    }

    /// Feed transport events into the state machine until the transport goes away.
    pub async fn run(self, mut transport_events: TransportEventReceiver) {
        while let Some(event) = transport_events.recv().await {
            trace!("Transport event: {:?}", event);
            self.handle_transport_event(event);
        }
        info!("Transport event stream closed");
    }

    pub fn spawn_event_pump(&self, transport_events: TransportEventReceiver) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(transport_events))
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut SessionInner, next: SessionState) {
        if inner.state != next {
            info!("Session state: {} -> {}", inner.state, next);
            inner.state = next;
            self.state_tx.send_replace(next);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn enter_disconnected(&self, inner: &mut SessionInner, reason: Option<GattError>) {
        if let Some(reason) = reason {
            warn!("Link closed: {}", reason);
        }
        inner.services.clear();
        inner.notifying = None;
        inner.peripheral = None;
        inner.attempt += 1;
        self.set_state(inner, SessionState::Disconnected);
        self.emit(SessionEvent::Disconnected);
    }

    fn arm_connect_timeout(&self, attempt: u64, timeout: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, connect timeout disabled");
            return;
        };

        let session = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            session.expire_connect(attempt);
        });
    }

    fn expire_connect(&self, attempt: u64) {
        let mut inner = self.lock();
        if inner.state != SessionState::Connecting || inner.attempt != attempt {
            return;
        }

        if let Err(e) = self.transport.disconnect() {
            warn!("Failed to cancel connection attempt: {:#}", e);
        }
        self.enter_disconnected(&mut inner, Some(GattError::ConnectionTimeout));
    }
}

/// Attach registry names to a raw discovery result
fn describe(services: Vec<DiscoveredService>) -> Vec<ServiceDescriptor> {
    services
        .into_iter()
        .map(|service| ServiceDescriptor {
            uuid: service.uuid,
            name: protocol::resolve_name(&service.uuid, UNKNOWN_SERVICE).to_string(),
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| CharacteristicDescriptor {
                    uuid: c.uuid,
                    service_uuid: service.uuid,
                    name: protocol::resolve_name(&c.uuid, UNKNOWN_CHARACTERISTIC).to_string(),
                    properties: c.properties,
                    handle: c.handle,
                })
                .collect(),
        })
        .collect()
}
