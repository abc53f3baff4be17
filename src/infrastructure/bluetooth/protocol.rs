//! Bot GATT Profile
//!
//! Fixed attribute registry for the robot: the service and characteristic
//! UUIDs the firmware exposes, their display names, and the single-byte
//! codes each characteristic accepts.

use uuid::Uuid;

/// Bot service UUID (16-bit 0xFFF0 on the Bluetooth base UUID)
pub const BOT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FFF0_0000_1000_8000_00805F9B34FB);

/// Motion characteristic - accepts one [`MotionAction`] byte
pub const MOTION_CHAR_UUID: Uuid = Uuid::from_u128(0x0000FFF1_0000_1000_8000_00805F9B34FB);

/// Relay characteristics - each accepts one [`RelayAction`] byte
pub const RELAY1_CHAR_UUID: Uuid = Uuid::from_u128(0x0000FFF2_0000_1000_8000_00805F9B34FB);
pub const RELAY2_CHAR_UUID: Uuid = Uuid::from_u128(0x0000FFF3_0000_1000_8000_00805F9B34FB);
pub const RELAY3_CHAR_UUID: Uuid = Uuid::from_u128(0x0000FFF4_0000_1000_8000_00805F9B34FB);
pub const RELAY4_CHAR_UUID: Uuid = Uuid::from_u128(0x0000FFF5_0000_1000_8000_00805F9B34FB);

/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Fallback display names for attributes missing from the registry
pub const UNKNOWN_SERVICE: &str = "Unknown service";
pub const UNKNOWN_CHARACTERISTIC: &str = "Unknown characteristic";

const ATTRIBUTES: &[(Uuid, &str)] = &[
    (BOT_SERVICE_UUID, "VNG_BOT_SERVICE"),
    (MOTION_CHAR_UUID, "Bot motion"),
    (RELAY1_CHAR_UUID, "Control relay 1"),
    (RELAY2_CHAR_UUID, "Control relay 2"),
    (RELAY3_CHAR_UUID, "Control relay 3"),
    (RELAY4_CHAR_UUID, "Control relay 4"),
    (CLIENT_CHARACTERISTIC_CONFIG, "Client characteristic configuration"),
];

/// Look up the display name of a known attribute, or return `fallback`.
pub fn resolve_name<'a>(uuid: &Uuid, fallback: &'a str) -> &'a str {
    ATTRIBUTES
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
        .unwrap_or(fallback)
}

/// Whether `(service, characteristic)` is one of the five profile characteristics
pub fn is_profile_characteristic(service: &Uuid, characteristic: &Uuid) -> bool {
    *service == BOT_SERVICE_UUID
        && (*characteristic == MOTION_CHAR_UUID
            || Relay::ALL.iter().any(|r| r.characteristic_uuid() == *characteristic))
}

/// Motion commands accepted by the motion characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MotionAction {
    Stop = 0,
    Forward = 1,
    Back = 2,
    Left = 3,
    Right = 4,
}

impl MotionAction {
    pub const ALL: [MotionAction; 5] = [
        Self::Stop,
        Self::Forward,
        Self::Back,
        Self::Left,
        Self::Right,
    ];

    /// Wire byte for this action
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Stop => "Stop",
            Self::Forward => "Go forward",
            Self::Back => "Go back",
            Self::Left => "Rotate left",
            Self::Right => "Rotate right",
        }
    }
}

/// Relay commands. Note the firmware is active-low: `On` is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayAction {
    On = 0,
    Off = 1,
}

impl RelayAction {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<bool> for RelayAction {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// One of the four relay outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relay {
    One,
    Two,
    Three,
    Four,
}

impl Relay {
    pub const ALL: [Relay; 4] = [Self::One, Self::Two, Self::Three, Self::Four];

    /// 1-based relay number as printed on the board
    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }

    pub fn characteristic_uuid(self) -> Uuid {
        match self {
            Self::One => RELAY1_CHAR_UUID,
            Self::Two => RELAY2_CHAR_UUID,
            Self::Three => RELAY3_CHAR_UUID,
            Self::Four => RELAY4_CHAR_UUID,
        }
    }
}

impl TryFrom<u8> for Relay {
    type Error = u8;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        match number {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            4 => Ok(Self::Four),
            other => Err(other),
        }
    }
}

/// Characteristic family a code is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Motion(MotionAction),
    Relay(RelayAction),
}

/// Map a command to its wire byte
pub fn command_code(kind: CommandKind) -> u8 {
    match kind {
        CommandKind::Motion(action) => action.code(),
        CommandKind::Relay(action) => action.code(),
    }
}

/// A semantic command resolved to its profile write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub payload: u8,
}

impl Command {
    pub fn motion(action: MotionAction) -> Self {
        Self {
            service: BOT_SERVICE_UUID,
            characteristic: MOTION_CHAR_UUID,
            payload: command_code(CommandKind::Motion(action)),
        }
    }

    pub fn relay(relay: Relay, on: bool) -> Self {
        Self {
            service: BOT_SERVICE_UUID,
            characteristic: relay.characteristic_uuid(),
            payload: command_code(CommandKind::Relay(RelayAction::from(on))),
        }
    }

    /// Raw bytes written to the characteristic
    pub fn as_bytes(&self) -> [u8; 1] {
        [self.payload]
    }
}
