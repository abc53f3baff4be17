//! Recording transport for tests

use crate::domain::models::{CharProperties, CharacteristicHandle};
use crate::infrastructure::bluetooth::protocol::{
    BOT_SERVICE_UUID, MOTION_CHAR_UUID, RELAY1_CHAR_UUID, RELAY2_CHAR_UUID, RELAY3_CHAR_UUID,
    RELAY4_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredCharacteristic, DiscoveredService, GattTransport, LinkAttempt, TransportEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub const MOTION_HANDLE: CharacteristicHandle = CharacteristicHandle(1);
pub const RELAY1_HANDLE: CharacteristicHandle = CharacteristicHandle(2);
pub const RELAY2_HANDLE: CharacteristicHandle = CharacteristicHandle(3);
pub const DEVICE_NAME_HANDLE: CharacteristicHandle = CharacteristicHandle(10);

/// Generic Access service and its Device Name characteristic
pub const GENERIC_ACCESS_UUID: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805F9B34FB);
pub const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x00002A00_0000_1000_8000_00805F9B34FB);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(String),
    Disconnect,
    DiscoverServices,
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>),
    SetNotify(CharacteristicHandle, bool),
}

#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<TransportCall>>,
    fail_connect: AtomicBool,
    last_attempt: Mutex<Option<LinkAttempt>>,
}

impl FakeTransport {
    pub fn failing_connect() -> Self {
        let transport = Self::default();
        transport.fail_connect.store(true, Ordering::SeqCst);
        transport
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn writes(&self) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Write(..)))
            .collect()
    }

    /// Attempt id of the latest connect request, `LinkAttempt(0)` if none
    pub fn last_attempt(&self) -> LinkAttempt {
        self.last_attempt.lock().unwrap().unwrap_or(LinkAttempt(0))
    }

    /// Link-up report for the latest connect request
    pub fn connected(&self) -> TransportEvent {
        TransportEvent::Connected(self.last_attempt())
    }

    /// Link-down report for the latest connect request
    pub fn disconnected(&self) -> TransportEvent {
        TransportEvent::Disconnected(self.last_attempt())
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl GattTransport for FakeTransport {
    fn connect(&self, address: &str, attempt: LinkAttempt) -> anyhow::Result<()> {
        self.record(TransportCall::Connect(address.to_string()));
        *self.last_attempt.lock().unwrap() = Some(attempt);
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("adapter is powered off");
        }
        Ok(())
    }

    fn disconnect(&self) -> anyhow::Result<()> {
        self.record(TransportCall::Disconnect);
        Ok(())
    }

    fn discover_services(&self) -> anyhow::Result<()> {
        self.record(TransportCall::DiscoverServices);
        Ok(())
    }

    fn read_characteristic(&self, handle: CharacteristicHandle) -> anyhow::Result<()> {
        self.record(TransportCall::Read(handle));
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: CharacteristicHandle,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.record(TransportCall::Write(handle, payload.to_vec()));
        Ok(())
    }

    fn set_notify(&self, handle: CharacteristicHandle, enabled: bool) -> anyhow::Result<()> {
        self.record(TransportCall::SetNotify(handle, enabled));
        Ok(())
    }
}

/// The bot service with its five characteristics. Motion and relay 1 also
/// notify so subscription policy can be exercised.
pub fn bot_profile() -> Vec<DiscoveredService> {
    let chars = [
        (
            MOTION_CHAR_UUID,
            CharProperties::WRITE | CharProperties::READ | CharProperties::NOTIFY,
        ),
        (RELAY1_CHAR_UUID, CharProperties::WRITE | CharProperties::NOTIFY),
        (RELAY2_CHAR_UUID, CharProperties::WRITE),
        (RELAY3_CHAR_UUID, CharProperties::WRITE),
        (RELAY4_CHAR_UUID, CharProperties::WRITE_WITHOUT_RESPONSE),
    ];

    vec![DiscoveredService {
        uuid: BOT_SERVICE_UUID,
        characteristics: chars
            .iter()
            .enumerate()
            .map(|(i, (uuid, properties))| DiscoveredCharacteristic {
                uuid: *uuid,
                properties: *properties,
                handle: CharacteristicHandle(i as u32 + 1),
            })
            .collect(),
    }]
}

/// Bot profile plus a read-only Generic Access service
pub fn bot_profile_with_generic_access() -> Vec<DiscoveredService> {
    let mut services = vec![DiscoveredService {
        uuid: GENERIC_ACCESS_UUID,
        characteristics: vec![DiscoveredCharacteristic {
            uuid: DEVICE_NAME_UUID,
            properties: CharProperties::READ,
            handle: DEVICE_NAME_HANDLE,
        }],
    }];
    services.extend(bot_profile());
    services
}
