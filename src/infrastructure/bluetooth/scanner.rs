//! BLE Scanner Module
//!
//! Lists nearby peripherals so the user can pick the robot's address.

use crate::domain::models::{ScannedDevice, UNKNOWN_DEVICE};
use crate::infrastructure::bluetooth::protocol::BOT_SERVICE_UUID;
use anyhow::{Context, Result};
use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::Adapter;
use std::cmp::Reverse;
use std::time::Duration;
use tracing::{debug, info};

pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Scan for `duration` and return every peripheral seen, bots first
    pub async fn scan(&self, duration: Duration) -> Result<Vec<ScannedDevice>> {
        info!("Starting BLE scan for {:?}", duration);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .context("Can't scan BLE adapter for devices")?;
        tokio::time::sleep(duration).await;

        let peripherals = self.adapter.peripherals().await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }

        let mut devices = Vec::new();
        for peripheral in peripherals? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            devices.push(ScannedDevice {
                name: props
                    .local_name
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| UNKNOWN_DEVICE.to_string()),
                address: peripheral.address().to_string(),
                signal_strength: props.rssi,
                has_bot_service: props.services.contains(&BOT_SERVICE_UUID),
            });
        }

        sort_devices(&mut devices);
        info!("Found {} peripherals", devices.len());
        Ok(devices)
    }
}

/// Bots first, then strongest signal
pub fn sort_devices(devices: &mut [ScannedDevice]) {
    devices.sort_by_key(|d| {
        (
            Reverse(d.has_bot_service),
            Reverse(d.signal_strength.unwrap_or(i16::MIN)),
        )
    });
}
