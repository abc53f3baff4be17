//! Console control surface
//!
//! Line-oriented stand-in for the robot's button panel. Reads commands from
//! stdin, forwards them to the dispatcher and session, and prints session
//! events as they arrive.

use crate::domain::models::{PeripheralIdentity, SessionEvent, SessionState};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::protocol::{MotionAction, Relay};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::{CommandDispatcher, GattSession};
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{error, warn};
use uuid::Uuid;

const HELP: &str = "\
Commands:
  connect [ADDR]         connect (defaults to the last device)
  disconnect             drop the link
  discover               discover services
  services               list discovered services
  forward|back|left|right|stop
  relay N [on|off]       set relay N (1-4), toggles without on/off
  read UUID              read a characteristic
  notify UUID on|off     subscribe to a characteristic
  scan                   list nearby devices
  status                 show connection state
  help                   show this text
  quit                   exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect(Option<String>),
    Disconnect,
    Discover,
    Services,
    Motion(MotionAction),
    Relay { relay: Relay, on: Option<bool> },
    Read(Uuid),
    Notify(Uuid, bool),
    Scan,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

fn parse_switch(word: Option<&str>) -> Option<Option<bool>> {
    match word {
        None => Some(None),
        Some("on") => Some(Some(true)),
        Some("off") => Some(Some(false)),
        Some(_) => None,
    }
}

impl FromStr for ConsoleCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let lowered = line.trim().to_lowercase();
        let mut words = lowered.split_whitespace();
        let Some(command) = words.next() else {
            return Err(ParseError::Empty);
        };
        let arg = words.next();

        let parsed = match command {
            "connect" => Self::Connect(arg.map(str::to_string)),
            "disconnect" => Self::Disconnect,
            "discover" => Self::Discover,
            "services" => Self::Services,
            "forward" | "f" => Self::Motion(MotionAction::Forward),
            "back" | "b" => Self::Motion(MotionAction::Back),
            "left" | "l" => Self::Motion(MotionAction::Left),
            "right" | "r" => Self::Motion(MotionAction::Right),
            "stop" | "s" => Self::Motion(MotionAction::Stop),
            "relay" => {
                const USAGE: &str = "relay N [on|off]";
                let relay = arg
                    .and_then(|n| n.parse::<u8>().ok())
                    .and_then(|n| Relay::try_from(n).ok())
                    .ok_or(ParseError::Usage(USAGE))?;
                let on = parse_switch(words.next()).ok_or(ParseError::Usage(USAGE))?;
                Self::Relay { relay, on }
            }
            "read" => {
                let uuid = arg
                    .and_then(|u| Uuid::parse_str(u).ok())
                    .ok_or(ParseError::Usage("read UUID"))?;
                Self::Read(uuid)
            }
            "notify" => {
                const USAGE: &str = "notify UUID on|off";
                let uuid = arg
                    .and_then(|u| Uuid::parse_str(u).ok())
                    .ok_or(ParseError::Usage(USAGE))?;
                let enabled = parse_switch(words.next())
                    .flatten()
                    .ok_or(ParseError::Usage(USAGE))?;
                Self::Notify(uuid, enabled)
            }
            "scan" => Self::Scan,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(parsed)
    }
}

/// Local view of the robot's controls, kept in step with session events
#[derive(Debug, Default)]
pub struct ControlPanel {
    enabled: bool,
    relays: [bool; 4],
}

impl ControlPanel {
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Connected | SessionEvent::Disconnected => self.set_enabled(false),
            SessionEvent::ServicesDiscovered => self.set_enabled(true),
            SessionEvent::DataAvailable { .. } => {}
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.relays = [false; 4];
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn relay(&self, relay: Relay) -> bool {
        self.relays[usize::from(relay.number() - 1)]
    }

    pub fn set_relay(&mut self, relay: Relay, on: bool) {
        self.relays[usize::from(relay.number() - 1)] = on;
    }

    /// Explicit request, or the opposite of the current toggle
    pub fn relay_target(&self, relay: Relay, requested: Option<bool>) -> bool {
        requested.unwrap_or(!self.relay(relay))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue(String),
    Quit,
}

pub struct Console {
    session: GattSession,
    dispatcher: CommandDispatcher,
    scanner: Option<BleScanner>,
    settings: SettingsService,
    panel: ControlPanel,
}

impl Console {
    pub fn new(
        session: GattSession,
        settings: SettingsService,
        scanner: Option<BleScanner>,
    ) -> Self {
        Self {
            dispatcher: CommandDispatcher::default(),
            session,
            scanner,
            settings,
            panel: ControlPanel::default(),
        }
    }

    /// Subscribe to the session, then make the start-up connect so that every
    /// event it causes is seen.
    async fn start(
        &mut self,
        startup_address: Option<String>,
    ) -> (
        broadcast::Receiver<SessionEvent>,
        watch::Receiver<SessionState>,
        Option<String>,
    ) {
        let events = self.session.subscribe();
        let state = self.session.watch_state();
        let output = match startup_address {
            Some(address) => match self.execute(ConsoleCommand::Connect(Some(address))).await {
                Flow::Continue(output) => Some(output),
                Flow::Quit => None,
            },
            None => None,
        };
        (events, state, output)
    }

    pub async fn run(mut self, startup_address: Option<String>) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        println!("{}", HELP);
        let (mut events, mut state, startup) = self.start(startup_address).await;
        if let Some(output) = startup {
            println!("{}", output);
        }
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<ConsoleCommand>() {
                        Ok(command) => match self.execute(command).await {
                            Flow::Continue(output) => println!("{}", output),
                            Flow::Quit => break,
                        },
                        Err(e) => println!("{}", e),
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => println!("{}", self.on_event(&event)),
                    Err(RecvError::Lagged(missed)) => warn!("Console missed {} session events", missed),
                    Err(RecvError::Closed) => break,
                },
                // Connecting has no session event of its own
                Ok(()) = state.changed() => {
                    if *state.borrow_and_update() == SessionState::Connecting {
                        println!("Connecting...");
                    }
                },
            }
        }

        self.session.disconnect();
        Ok(())
    }

    /// Update the panel for a session event and describe it
    pub fn on_event(&mut self, event: &SessionEvent) -> String {
        self.panel.apply(event);
        // Commands only reach the session while the controls are live
        if self.panel.is_enabled() {
            if !self.dispatcher.is_bound() {
                self.dispatcher.bind(self.session.clone());
            }
        } else {
            self.dispatcher.unbind();
        }
        match event {
            SessionEvent::Connected => {
                if let Some(peripheral) = self.session.peripheral() {
                    if let Err(e) = self.settings.remember_peripheral(&peripheral) {
                        error!("Failed to save settings: {:#}", e);
                    }
                }
                "Connected".to_string()
            }
            SessionEvent::Disconnected => "Disconnected, controls disabled".to_string(),
            SessionEvent::ServicesDiscovered => "Services discovered, controls enabled".to_string(),
            SessionEvent::DataAvailable {
                characteristic,
                value,
            } => format!("{}: {}", characteristic.name, hex(value)),
        }
    }

    pub async fn execute(&mut self, command: ConsoleCommand) -> Flow {
        let output = match command {
            ConsoleCommand::Connect(address) => self.connect(address),
            ConsoleCommand::Disconnect => {
                self.session.disconnect();
                self.session.state().to_string()
            }
            ConsoleCommand::Discover => match self.session.discover_services() {
                Ok(()) => "Discovering services...".to_string(),
                Err(e) => format!("Cannot discover: {}", e),
            },
            ConsoleCommand::Services => self.describe_services(),
            ConsoleCommand::Motion(action) => {
                match self.dispatcher.send_motion(action) {
                    Ok(Some(_)) => action.label().to_string(),
                    Ok(None) => disabled_message(),
                    Err(e) => format!("Command failed: {}", e),
                }
            }
            ConsoleCommand::Relay { relay, on } => {
                let target = self.panel.relay_target(relay, on);
                match self.dispatcher.send_relay(relay, target) {
                    Ok(Some(_)) => {
                        self.panel.set_relay(relay, target);
                        format!("Relay {} {}", relay.number(), on_off(target))
                    }
                    Ok(None) => disabled_message(),
                    Err(e) => format!("Command failed: {}", e),
                }
            }
            ConsoleCommand::Read(uuid) => match self.session.characteristic_by_uuid(&uuid) {
                Some(characteristic) => match self.session.read_characteristic(&characteristic) {
                    Ok(()) => format!("Reading {}...", characteristic.name),
                    Err(e) => format!("Cannot read: {}", e),
                },
                None => format!("No discovered characteristic {}", uuid),
            },
            ConsoleCommand::Notify(uuid, enabled) => {
                match self.session.characteristic_by_uuid(&uuid) {
                    Some(characteristic) => {
                        match self.session.set_notification(&characteristic, enabled) {
                            Ok(()) => format!(
                                "Notifications {} for {}",
                                on_off(enabled),
                                characteristic.name
                            ),
                            Err(e) => format!("Cannot change notifications: {}", e),
                        }
                    }
                    None => format!("No discovered characteristic {}", uuid),
                }
            }
            ConsoleCommand::Scan => self.scan().await,
            ConsoleCommand::Status => self.status(),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => return Flow::Quit,
        };
        Flow::Continue(output)
    }

    fn connect(&mut self, address: Option<String>) -> String {
        let target = match address {
            Some(address) => PeripheralIdentity::from(address),
            None => match self.settings.last_peripheral() {
                Some(peripheral) => peripheral,
                None => return "No previous device, use: connect ADDR".to_string(),
            },
        };
        let state = self.session.connect(target.clone());
        format!("{}: {}", target, state)
    }

    fn describe_services(&self) -> String {
        let services = self.session.services();
        if services.is_empty() {
            return "No services discovered".to_string();
        }

        let mut out = String::new();
        for service in services {
            let _ = writeln!(out, "{}  {}", service.name, service.uuid);
            for c in &service.characteristics {
                let mut flags = Vec::new();
                if c.properties.is_readable() {
                    flags.push("read");
                }
                if c.properties.is_writable() {
                    flags.push("write");
                }
                if c.properties.is_notifiable() {
                    flags.push("notify");
                }
                let _ = writeln!(out, "    {}  {}  [{}]", c.name, c.uuid, flags.join(", "));
            }
        }
        out.trim_end().to_string()
    }

    async fn scan(&self) -> String {
        let Some(scanner) = &self.scanner else {
            return "Scanning is not available".to_string();
        };

        let duration = Duration::from_secs(self.settings.get().scan_duration_secs);
        match scanner.scan(duration).await {
            Ok(devices) if devices.is_empty() => "No devices found".to_string(),
            Ok(devices) => devices
                .iter()
                .map(|d| {
                    format!(
                        "{}{}  {}  {}",
                        if d.has_bot_service { "* " } else { "  " },
                        d.address,
                        d.signal_strength
                            .map(|rssi| format!("{} dBm", rssi))
                            .unwrap_or_else(|| "? dBm".to_string()),
                        d.name
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Scan failed: {:#}", e),
        }
    }

    fn status(&self) -> String {
        let state = self.session.state();
        let mut out = format!("State: {}", state);
        if let Some(peripheral) = self.session.peripheral() {
            let _ = write!(out, "\nDevice: {}", peripheral);
        }
        if let Some(active) = self.session.active_notification() {
            let _ = write!(out, "\nNotifying: {}", active.name);
        }
        if state == SessionState::ServicesDiscovered {
            let relays: Vec<String> = Relay::ALL
                .iter()
                .map(|r| format!("{}={}", r.number(), on_off(self.panel.relay(*r))))
                .collect();
            let _ = write!(out, "\nRelays: {}", relays.join(" "));
        }
        out
    }
}

fn disabled_message() -> String {
    "Controls are disabled until services are discovered".to_string()
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn hex(value: &[u8]) -> String {
    value
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::SessionConfig;
    use crate::infrastructure::bluetooth::protocol::MOTION_CHAR_UUID;
    use crate::infrastructure::bluetooth::testing::{
        bot_profile, FakeTransport, TransportCall, MOTION_HANDLE, RELAY2_HANDLE,
    };
    use crate::infrastructure::bluetooth::transport::TransportEvent;
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "connect aa:bb:cc:dd:ee:ff".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Connect(Some("aa:bb:cc:dd:ee:ff".to_string())))
        );
        assert_eq!("  Forward ".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Motion(MotionAction::Forward)));
        assert_eq!(
            "relay 2 on".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Relay {
                relay: Relay::Two,
                on: Some(true)
            })
        );
        assert_eq!(
            "relay 4".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Relay {
                relay: Relay::Four,
                on: None
            })
        );
        assert_eq!(
            "notify 0000fff1-0000-1000-8000-00805f9b34fb off".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Notify(MOTION_CHAR_UUID, false))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<ConsoleCommand>(), Err(ParseError::Empty));
        assert_eq!(
            "jump".parse::<ConsoleCommand>(),
            Err(ParseError::Unknown("jump".to_string()))
        );
        assert!(matches!(
            "relay 5 on".parse::<ConsoleCommand>(),
            Err(ParseError::Usage(_))
        ));
        assert!(matches!(
            "relay 1 maybe".parse::<ConsoleCommand>(),
            Err(ParseError::Usage(_))
        ));
        assert!(matches!(
            "notify fff1".parse::<ConsoleCommand>(),
            Err(ParseError::Usage(_))
        ));
    }

    #[test]
    fn test_panel_follows_session_events() {
        let mut panel = ControlPanel::default();
        assert!(!panel.is_enabled());

        panel.apply(&SessionEvent::ServicesDiscovered);
        assert!(panel.is_enabled());
        panel.set_relay(Relay::Three, true);
        assert!(!panel.relay_target(Relay::Three, None));
        assert!(panel.relay_target(Relay::One, None));

        panel.apply(&SessionEvent::Disconnected);
        assert!(!panel.is_enabled());
        assert!(!panel.relay(Relay::Three));
    }

    fn console() -> (Console, Arc<FakeTransport>) {
        console_with(FakeTransport::default())
    }

    fn console_with(transport: FakeTransport) -> (Console, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        let session = GattSession::new(
            transport.clone(),
            SessionConfig {
                connect_timeout: None,
                auto_discover_services: false,
                event_channel_capacity: 8,
            },
        );
        let path = std::env::temp_dir()
            .join(format!("bot_remote_console_{}", std::process::id()))
            .join("settings.json");
        let settings = SettingsService::with_path(path);
        (Console::new(session, settings, None), transport)
    }

    fn bring_up(console: &mut Console, transport: &FakeTransport) {
        console.session.connect("AA:BB:CC:DD:EE:FF");
        console.session.handle_transport_event(transport.connected());
        console
            .session
            .handle_transport_event(TransportEvent::ServicesDiscovered(bot_profile()));
        console.on_event(&SessionEvent::ServicesDiscovered);
    }

    #[tokio::test]
    async fn test_controls_refused_until_discovered() {
        let (mut console, transport) = console();

        let flow = console
            .execute(ConsoleCommand::Motion(MotionAction::Forward))
            .await;
        assert_eq!(flow, Flow::Continue(disabled_message()));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_startup_connect_is_observed() {
        let (mut console, transport) = console();

        let (_events, state, output) = console.start(Some("aa:bb:cc:dd:ee:ff".to_string())).await;

        assert!(output.is_some_and(|o| o.contains("AA:BB:CC:DD:EE:FF") && o.ends_with(": Connecting")));
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow(), SessionState::Connecting);
        assert_eq!(
            transport.calls(),
            vec![TransportCall::Connect("AA:BB:CC:DD:EE:FF".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_startup_connect_is_reported() {
        let (mut console, _) = console_with(FakeTransport::failing_connect());

        let (mut events, _state, output) =
            console.start(Some("AA:BB:CC:DD:EE:FF".to_string())).await;

        assert!(output.is_some_and(|o| o.ends_with(": Disconnected")));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Disconnected)));
    }

    #[tokio::test]
    async fn test_relay_toggle_and_motion() {
        let (mut console, transport) = console();
        bring_up(&mut console, &transport);
        transport.clear();

        let relay = ConsoleCommand::Relay {
            relay: Relay::Two,
            on: None,
        };
        assert_eq!(
            console.execute(relay.clone()).await,
            Flow::Continue("Relay 2 on".to_string())
        );
        assert_eq!(
            console.execute(relay).await,
            Flow::Continue("Relay 2 off".to_string())
        );
        console
            .execute(ConsoleCommand::Motion(MotionAction::Left))
            .await;

        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Write(RELAY2_HANDLE, vec![0x00]),
                TransportCall::Write(RELAY2_HANDLE, vec![0x01]),
                TransportCall::Write(MOTION_HANDLE, vec![0x03]),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_resets_relays() {
        let (mut console, transport) = console();
        bring_up(&mut console, &transport);
        console
            .execute(ConsoleCommand::Relay {
                relay: Relay::One,
                on: Some(true),
            })
            .await;
        assert!(console.panel.relay(Relay::One));

        console.session.handle_transport_event(transport.disconnected());
        console.on_event(&SessionEvent::Disconnected);

        assert!(!console.panel.relay(Relay::One));
        assert!(matches!(
            console.execute(ConsoleCommand::Motion(MotionAction::Stop)).await,
            Flow::Continue(msg) if msg == disabled_message()
        ));
    }

    #[tokio::test]
    async fn test_services_listing() {
        let (mut console, transport) = console();
        assert_eq!(
            console.execute(ConsoleCommand::Services).await,
            Flow::Continue("No services discovered".to_string())
        );

        bring_up(&mut console, &transport);
        let Flow::Continue(listing) = console.execute(ConsoleCommand::Services).await else {
            panic!("unexpected quit");
        };
        assert!(listing.starts_with("VNG_BOT_SERVICE"));
        assert!(listing.contains("Control relay 4"));
        assert!(listing.contains("[read, write, notify]"));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xAB, 0x1]), "00 AB 01");
        assert_eq!(hex(&[]), "");
    }
}
