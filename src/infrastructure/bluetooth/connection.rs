//! BLE Connection Module
//!
//! btleplug implementation of [`GattTransport`]. Calls only enqueue a request;
//! a single worker task owns the link, runs requests in submission order and
//! reports outcomes as [`TransportEvent`]s. A connect in progress is abandoned
//! as soon as a disconnect or another connect is queued behind it.

use crate::domain::models::{CharProperties, CharacteristicHandle};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredCharacteristic, DiscoveredService, GattTransport, LinkAttempt, TransportEvent,
    TransportEventSender,
};
use anyhow::{anyhow, Context, Result};
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// First Bluetooth adapter of the host
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.context("Bluetooth is unavailable")?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to look for the requested address before giving up
    pub scan_timeout: Duration,
    /// Delay between peripheral list polls while looking
    pub scan_poll_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(5),
            scan_poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
enum LinkRequest {
    Connect(String, LinkAttempt),
    Disconnect,
    DiscoverServices,
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>),
    SetNotify(CharacteristicHandle, bool),
}

/// Transport handle; cheap to share behind an `Arc`
pub struct BleConnection {
    requests: mpsc::UnboundedSender<LinkRequest>,
}

impl BleConnection {
    /// Start the link worker on the current runtime
    pub async fn new(
        adapter: Adapter,
        event_sender: TransportEventSender,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let central_events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let (requests, request_rx) = mpsc::unbounded_channel();

        let worker = LinkWorker {
            adapter,
            event_sender,
            config,
            link: None,
        };
        tokio::spawn(worker.run(request_rx, central_events));

        Ok(Self { requests })
    }

    fn submit(&self, request: LinkRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| anyhow!("BLE worker has stopped"))
    }
}

impl GattTransport for BleConnection {
    fn connect(&self, address: &str, attempt: LinkAttempt) -> Result<()> {
        // Reject malformed addresses before they reach the radio
        BDAddr::from_str(address).map_err(|e| anyhow!("Invalid address {}: {}", address, e))?;
        self.submit(LinkRequest::Connect(address.to_string(), attempt))
    }

    fn disconnect(&self) -> Result<()> {
        self.submit(LinkRequest::Disconnect)
    }

    fn discover_services(&self) -> Result<()> {
        self.submit(LinkRequest::DiscoverServices)
    }

    fn read_characteristic(&self, handle: CharacteristicHandle) -> Result<()> {
        self.submit(LinkRequest::Read(handle))
    }

    fn write_characteristic(&self, handle: CharacteristicHandle, payload: &[u8]) -> Result<()> {
        self.submit(LinkRequest::Write(handle, payload.to_vec()))
    }

    fn set_notify(&self, handle: CharacteristicHandle, enabled: bool) -> Result<()> {
        self.submit(LinkRequest::SetNotify(handle, enabled))
    }
}

struct Link {
    attempt: LinkAttempt,
    peripheral: Peripheral,
    characteristics: HashMap<CharacteristicHandle, Characteristic>,
    notification_pump: JoinHandle<()>,
}

struct LinkWorker {
    adapter: Adapter,
    event_sender: TransportEventSender,
    config: ConnectionConfig,
    link: Option<Link>,
}

impl LinkWorker {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<LinkRequest>,
        mut central_events: CentralEvents,
    ) {
        // Request that interrupted a connect, handled before reading the queue again
        let mut pending = None;
        loop {
            let request = match pending.take() {
                Some(request) => request,
                None => tokio::select! {
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                    Some(event) = central_events.next() => {
                        self.on_central_event(event);
                        continue;
                    }
                },
            };
            debug!("Link request: {:?}", request);

            pending = match request {
                LinkRequest::Connect(address, attempt) => {
                    self.connect(&address, attempt, &mut requests, &mut central_events)
                        .await
                }
                other => {
                    self.handle(other).await;
                    None
                }
            };
        }

        self.teardown().await;
        info!("BLE worker stopped");
    }

    async fn handle(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Connect(..) => warn!("Connect requests are run by the worker loop"),
            LinkRequest::Disconnect => self.teardown().await,
            LinkRequest::DiscoverServices => {
                if let Err(e) = self.discover_services().await {
                    warn!("{:#}", e);
                }
            }
            LinkRequest::Read(handle) => {
                if let Err(e) = self.read(handle).await {
                    warn!("Read failed: {:#}", e);
                }
            }
            LinkRequest::Write(handle, payload) => {
                if let Err(e) = self.write(handle, &payload).await {
                    warn!("Write failed: {:#}", e);
                }
            }
            LinkRequest::SetNotify(handle, enabled) => {
                if let Err(e) = self.set_notify(handle, enabled).await {
                    warn!("Notification change failed: {:#}", e);
                }
            }
        }
    }

    /// Run one connect attempt while still listening for requests.
    ///
    /// Returns the disconnect or connect request that cancelled the attempt, if
    /// any. A cancelled attempt reports nothing; the session has already moved on.
    async fn connect(
        &mut self,
        address: &str,
        attempt: LinkAttempt,
        requests: &mut mpsc::UnboundedReceiver<LinkRequest>,
        central_events: &mut CentralEvents,
    ) -> Option<LinkRequest> {
        // One link at a time
        self.teardown().await;

        let target = match BDAddr::from_str(address) {
            Ok(target) => target,
            Err(e) => {
                warn!("Invalid address {}: {}", address, e);
                self.emit(TransportEvent::Disconnected(attempt));
                return None;
            }
        };

        let establishing = establish(self.adapter.clone(), target, self.config.clone());
        let raced = until_cancelled(establishing, requests);
        tokio::pin!(raced);
        // No link while connecting, so adapter events have nothing to act on
        let outcome = loop {
            tokio::select! {
                outcome = &mut raced => break outcome,
                Some(event) = central_events.next() => {
                    trace!("Adapter event while connecting: {:?}", event);
                }
            }
        };

        match outcome {
            Raced::Cancelled(request) => {
                info!("Connection attempt to {} cancelled", target);
                Some(request)
            }
            Raced::Done(result) => {
                let outcome = match result {
                    Ok(peripheral) => self.attach(peripheral, attempt).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    warn!("Connection to {} failed: {:#}", target, e);
                    self.emit(TransportEvent::Disconnected(attempt));
                }
                None
            }
        }
    }

    async fn attach(&mut self, peripheral: Peripheral, attempt: LinkAttempt) -> Result<()> {
        let mut notifications = match peripheral.notifications().await {
            Ok(notifications) => notifications,
            Err(e) => {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Failed to drop half-open link: {}", e);
                }
                return Err(e.into());
            }
        };

        let sender = self.event_sender.clone();
        let notification_pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = TransportEvent::DataAvailable {
                    characteristic: Some(notification.uuid),
                    value: notification.value,
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
        });

        info!("Device connected: {}", peripheral.address());
        self.link = Some(Link {
            attempt,
            peripheral,
            characteristics: HashMap::new(),
            notification_pump,
        });
        self.emit(TransportEvent::Connected(attempt));
        Ok(())
    }

    /// Drop the current link. Silent: the session already knows.
    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.notification_pump.abort();
            if let Err(e) = link.peripheral.disconnect().await {
                warn!("Failed to disconnect: {}", e);
            }
            info!("Disconnected from device");
        }
    }

    fn on_central_event(&mut self, event: CentralEvent) {
        let CentralEvent::DeviceDisconnected(id) = event else {
            return;
        };

        let ours = self
            .link
            .as_ref()
            .is_some_and(|link| link.peripheral.id() == id);
        if ours {
            info!("Device dropped the link: {:?}", id);
            if let Some(link) = self.link.take() {
                link.notification_pump.abort();
                self.emit(TransportEvent::Disconnected(link.attempt));
            }
        }
    }

    async fn discover_services(&mut self) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| anyhow!("Cannot discover services without a link"))?;

        link.peripheral
            .discover_services()
            .await
            .context("Service discovery failed")?;

        link.characteristics.clear();
        let mut services = Vec::new();
        let mut next_handle = 1;
        for service in link.peripheral.services() {
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics {
                let handle = CharacteristicHandle(next_handle);
                next_handle += 1;
                characteristics.push(DiscoveredCharacteristic {
                    uuid: characteristic.uuid,
                    properties: CharProperties::from_bits_truncate(characteristic.properties.bits()),
                    handle,
                });
                link.characteristics.insert(handle, characteristic);
            }
            services.push(DiscoveredService {
                uuid: service.uuid,
                characteristics,
            });
        }

        self.emit(TransportEvent::ServicesDiscovered(services));
        Ok(())
    }

    fn resolve(&self, handle: CharacteristicHandle) -> Result<(&Peripheral, &Characteristic)> {
        let link = self.link.as_ref().ok_or_else(|| anyhow!("No link"))?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .ok_or_else(|| anyhow!("Unknown characteristic handle {:?}", handle))?;
        Ok((&link.peripheral, characteristic))
    }

    async fn read(&self, handle: CharacteristicHandle) -> Result<()> {
        let (peripheral, characteristic) = self.resolve(handle)?;
        let value = peripheral.read(characteristic).await?;
        self.emit(TransportEvent::DataAvailable {
            characteristic: Some(characteristic.uuid),
            value,
        });
        Ok(())
    }

    async fn write(&self, handle: CharacteristicHandle, payload: &[u8]) -> Result<()> {
        let (peripheral, characteristic) = self.resolve(handle)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral.write(characteristic, payload, write_type).await?;
        Ok(())
    }

    async fn set_notify(&self, handle: CharacteristicHandle, enabled: bool) -> Result<()> {
        let (peripheral, characteristic) = self.resolve(handle)?;
        if enabled {
            peripheral.subscribe(characteristic).await?;
        } else {
            peripheral.unsubscribe(characteristic).await?;
        }
        Ok(())
    }

    fn emit(&self, event: TransportEvent) {
        if self.event_sender.send(event).is_err() {
            debug!("No session listening for transport events");
        }
    }
}

enum Raced<T> {
    Done(T),
    Cancelled(LinkRequest),
}

/// Drive `attempt` until it finishes or a connect or disconnect request
/// arrives. Other requests need a link and are dropped.
async fn until_cancelled<F: Future>(
    attempt: F,
    requests: &mut mpsc::UnboundedReceiver<LinkRequest>,
) -> Raced<F::Output> {
    tokio::pin!(attempt);
    loop {
        tokio::select! {
            output = &mut attempt => return Raced::Done(output),
            Some(request) = requests.recv() => match request {
                LinkRequest::Connect(..) | LinkRequest::Disconnect => {
                    return Raced::Cancelled(request);
                }
                other => warn!("No link yet, dropping {:?}", other),
            },
        }
    }
}

/// Find `target` and bring its link up
async fn establish(
    adapter: Adapter,
    target: BDAddr,
    config: ConnectionConfig,
) -> Result<Peripheral> {
    let peripheral = find_peripheral(&adapter, target, &config).await?;

    info!("Connecting to Bluetooth device: {}", target);
    peripheral
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", target))?;
    Ok(peripheral)
}

async fn find_peripheral(
    adapter: &Adapter,
    target: BDAddr,
    config: &ConnectionConfig,
) -> Result<Peripheral> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .context("Failed to start scan")?;

    let found = poll_for(adapter, target, config).await;

    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop scan: {}", e);
    }
    found?.ok_or_else(|| anyhow!("Peripheral {} not found", target))
}

async fn poll_for(
    adapter: &Adapter,
    target: BDAddr,
    config: &ConnectionConfig,
) -> Result<Option<Peripheral>> {
    let deadline = Instant::now() + config.scan_timeout;
    loop {
        let peripherals = adapter.peripherals().await?;
        if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == target) {
            return Ok(Some(peripheral));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(config.scan_poll_interval).await;
    }
}
