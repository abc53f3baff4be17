//! Platform transport contract
//!
//! The GATT session only talks to the radio through [`GattTransport`]. Every
//! call submits a request and returns at once; outcomes come back later as
//! [`TransportEvent`]s on the channel handed to the transport when it is built.

use crate::domain::models::{CharProperties, CharacteristicHandle};
use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Characteristic as reported by the platform during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub handle: CharacteristicHandle,
}

/// Service as reported by the platform during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Identifies one connect request. Link events carry the attempt they belong
/// to so reports from an abandoned attempt cannot touch a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkAttempt(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(LinkAttempt),
    /// The attempt failed, or its link went down
    Disconnected(LinkAttempt),
    ServicesDiscovered(Vec<DiscoveredService>),
    /// Value from a read or a notification. Some platforms cannot tell which
    /// characteristic a push came from, hence the `Option`.
    DataAvailable {
        characteristic: Option<Uuid>,
        value: Vec<u8>,
    },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub trait GattTransport: Send + Sync {
    fn connect(&self, address: &str, attempt: LinkAttempt) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    fn discover_services(&self) -> Result<()>;
    fn read_characteristic(&self, handle: CharacteristicHandle) -> Result<()>;
    fn write_characteristic(&self, handle: CharacteristicHandle, payload: &[u8]) -> Result<()>;
    fn set_notify(&self, handle: CharacteristicHandle, enabled: bool) -> Result<()>;
}
