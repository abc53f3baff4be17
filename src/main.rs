mod domain;
mod infrastructure;
mod presentation;

use anyhow::Context;
use domain::settings::SettingsService;
use infrastructure::bluetooth::connection::{default_adapter, BleConnection, ConnectionConfig};
use infrastructure::bluetooth::scanner::BleScanner;
use infrastructure::bluetooth::GattSession;
use infrastructure::logging::init_logger;
use presentation::console::Console;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match SettingsService::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings, using defaults: {:#}", e);
            SettingsService::with_path(PathBuf::from("settings.json"))
        }
    };
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Starting bot remote");

    let adapter = default_adapter().await?;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connection = BleConnection::new(
        adapter.clone(),
        event_tx,
        ConnectionConfig {
            scan_timeout: Duration::from_secs(settings.get().scan_duration_secs),
            ..Default::default()
        },
    )
    .await
    .context("Failed to start the BLE worker")?;

    let session = GattSession::new(Arc::new(connection), settings.session_config());
    let pump = session.spawn_event_pump(event_rx);

    let console = Console::new(session, settings, Some(BleScanner::new(adapter)));
    if let Err(e) = console.run(std::env::args().nth(1)).await {
        error!("Console stopped: {:#}", e);
    }

    pump.abort();
    info!("Bot remote stopped");
    Ok(())
}
