//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of grow controllers.

use crate::error::Result;
use crate::infrastructure::bluetooth::gatt::{GattAdapter, ScannedDevice};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// BLE Scanner for discovering grow controllers
pub struct BleScanner {
    adapter: Arc<dyn GattAdapter>,
    service_uuid: Uuid,
}

impl BleScanner {
    /// Create a new scanner filtering on `service_uuid`
    pub fn new(adapter: Arc<dyn GattAdapter>, service_uuid: Uuid) -> Self {
        Self {
            adapter,
            service_uuid,
        }
    }

    /// Scan for `window` and return matches, strongest signal first
    ///
    /// Devices that advertise the control service sort ahead of devices that
    /// only match by name.
    pub async fn scan(&self, window: Duration) -> Result<Vec<ScannedDevice>> {
        info!("Starting BLE scan for service UUID: {}", self.service_uuid);

        let mut devices = self.adapter.scan(window, self.service_uuid).await?;
        devices.sort_by(|a, b| {
            b.advertises_service
                .cmp(&a.advertises_service)
                .then(b.rssi.unwrap_or(i16::MIN).cmp(&a.rssi.unwrap_or(i16::MIN)))
        });
        let mut seen = HashSet::new();
        devices.retain(|d| seen.insert(d.address.to_ascii_uppercase()));

        for device in &devices {
            info!(
                "Found {} ({}) rssi={:?}",
                device.name, device.address, device.rssi
            );
        }
        Ok(devices)
    }
}
