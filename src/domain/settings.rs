use crate::domain::models::PeripheralIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bot_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Session Settings
    /// `None` waits for the transport forever
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_discover_services: bool,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    // Scanning
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,

    // Devices
    #[serde(default)]
    pub last_connected_address: Option<String>,
    #[serde(default)]
    pub last_connected_name: Option<String>,
    #[serde(default)]
    pub known_addresses: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            auto_discover_services: default_true(),
            event_channel_capacity: default_event_channel_capacity(),
            scan_duration_secs: default_scan_duration_secs(),
            last_connected_address: None,
            last_connected_name: None,
            known_addresses: Vec::new(),
        }
    }
}

fn default_connect_timeout_ms() -> Option<u64> {
    Some(10_000)
}
fn default_event_channel_capacity() -> usize {
    64
}
fn default_scan_duration_secs() -> u64 {
    5
}

/// Tunables of the GATT session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Option<Duration>,
    pub auto_discover_services: bool,
    pub event_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from(&Settings::default())
    }
}

impl From<&Settings> for SessionConfig {
    fn from(s: &Settings) -> Self {
        Self {
            connect_timeout: s.connect_timeout_ms.map(Duration::from_millis),
            auto_discover_services: s.auto_discover_services,
            // broadcast::channel panics on zero
            event_channel_capacity: s.event_channel_capacity.max(1),
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is missing or invalid
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BotRemote");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&self.settings)
    }

    /// Peripheral used last time, if any
    pub fn last_peripheral(&self) -> Option<PeripheralIdentity> {
        let address = self.settings.last_connected_address.as_deref()?;
        Some(match &self.settings.last_connected_name {
            Some(name) => PeripheralIdentity::new(address, name.as_str()),
            None => PeripheralIdentity::from(address),
        })
    }

    pub fn remember_peripheral(&mut self, peripheral: &PeripheralIdentity) -> anyhow::Result<()> {
        let address = peripheral.address().to_string();
        self.settings.last_connected_address = Some(address.clone());
        self.settings.last_connected_name = Some(peripheral.name().to_string());
        if !self.settings.known_addresses.contains(&address) {
            self.settings.known_addresses.push(address);
        }
        self.save()
    }
}
