use bitflags::bitflags;
use std::fmt;
use uuid::Uuid;

/// Name shown for peripherals that do not advertise one
pub const UNKNOWN_DEVICE: &str = "Unknown device";

/// Target of a session: hardware address plus display name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    address: String,
    name: String,
}

impl PeripheralIdentity {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into().trim().to_uppercase(),
            name: name.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Addresses compare case-insensitively
    pub fn same_address(&self, other: &PeripheralIdentity) -> bool {
        self.address == other.address
    }
}

impl From<&str> for PeripheralIdentity {
    fn from(address: &str) -> Self {
        Self::new(address, UNKNOWN_DEVICE)
    }
}

impl From<String> for PeripheralIdentity {
    fn from(address: String) -> Self {
        Self::new(address, UNKNOWN_DEVICE)
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Connection lifecycle. Ordered so `state >= ServicesDiscovered` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ServicesDiscovered,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::ServicesDiscovered => "Services discovered",
        };
        f.write_str(label)
    }
}

bitflags! {
    /// Characteristic properties, using the bit values of the BLE
    /// characteristic declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
    }
}

impl CharProperties {
    pub fn is_readable(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn is_notifiable(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

/// Opaque reference to a characteristic, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub name: String,
    pub properties: CharProperties,
    pub handle: CharacteristicHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub name: String,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Events broadcast by the GATT session to its consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    ServicesDiscovered,
    DataAvailable {
        characteristic: CharacteristicDescriptor,
        value: Vec<u8>,
    },
}

/// A peripheral seen while scanning
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub signal_strength: Option<i16>,
    pub has_bot_service: bool,
}
