//! GATT capability layer
//!
//! The link never talks to a Bluetooth stack directly. It asks a [`GattAdapter`]
//! for a [`GattPeripheral`] and drives that. [`BtleplugAdapter`] is the real
//! implementation on top of `btleplug`.

use crate::error::{ControlError, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// A characteristic found during service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProps,
}

/// Subset of GATT properties the link cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// A device seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedDevice {
    pub address: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub advertises_service: bool,
}

/// One remote peripheral
#[async_trait]
pub trait GattPeripheral: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Enumerate every characteristic of every service
    async fn discover(&self) -> Result<Vec<DiscoveredCharacteristic>>;

    async fn read(&self, characteristic: &DiscoveredCharacteristic) -> Result<Vec<u8>>;

    async fn write(
        &self,
        characteristic: &DiscoveredCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enable notifications and return the values in arrival order
    async fn notifications(
        &self,
        characteristic: &DiscoveredCharacteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>>;
}

/// Source of peripherals (one radio)
#[async_trait]
pub trait GattAdapter: Send + Sync {
    /// Locate the peripheral with `address`
    async fn peripheral(&self, address: &str) -> Result<Arc<dyn GattPeripheral>>;

    /// Report devices advertising `service` or named like the product
    async fn scan(&self, window: Duration, service: Uuid) -> Result<Vec<ScannedDevice>>;
}

fn ble_error(context: &str, err: btleplug::Error) -> ControlError {
    ControlError::Connection(format!("{context}: {err}"))
}

/// `btleplug` backed adapter using the first radio found
pub struct BtleplugAdapter {
    adapter: Adapter,
    scan_window: Duration,
}

impl BtleplugAdapter {
    /// Open the first available Bluetooth adapter
    pub async fn first_available(scan_window: Duration) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| ble_error("open bluetooth manager", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ble_error("list adapters", e))?
            .into_iter()
            .next()
            .ok_or_else(|| ControlError::Connection("No Bluetooth adapters found".into()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter: {}", info);
        }

        Ok(Self {
            adapter,
            scan_window,
        })
    }

    async fn scan_for(&self, window: Duration) -> Result<Vec<Peripheral>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ble_error("start scan", e))?;
        tokio::time::sleep(window).await;
        let _ = self.adapter.stop_scan().await;

        self.adapter
            .peripherals()
            .await
            .map_err(|e| ble_error("list peripherals", e))
    }
}

#[async_trait]
impl GattAdapter for BtleplugAdapter {
    async fn peripheral(&self, address: &str) -> Result<Arc<dyn GattPeripheral>> {
        debug!("Looking for peripheral {}", address);
        for peripheral in self.scan_for(self.scan_window).await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(Arc::new(BtleplugPeripheral { peripheral }));
            }
        }
        Err(ControlError::Connection(format!(
            "Device {address} not found"
        )))
    }

    async fn scan(&self, window: Duration, service: Uuid) -> Result<Vec<ScannedDevice>> {
        info!("Scanning for grow controllers for {:?}", window);
        let mut found = Vec::new();

        for peripheral in self.scan_for(window).await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let name = props.local_name.unwrap_or_default();
            let advertises_service = props.services.contains(&service);
            if advertises_service || name.to_lowercase().contains("mars") {
                found.push(ScannedDevice {
                    address: peripheral.address().to_string(),
                    name: if name.is_empty() {
                        "Unknown".to_string()
                    } else {
                        name
                    },
                    rssi: props.rssi,
                    advertises_service,
                });
            }
        }

        info!("Found {} grow controllers", found.len());
        Ok(found)
    }
}

struct BtleplugPeripheral {
    peripheral: Peripheral,
}

impl BtleplugPeripheral {
    fn characteristic(&self, wanted: &DiscoveredCharacteristic) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == wanted.uuid && c.service_uuid == wanted.service)
            .ok_or_else(|| {
                ControlError::Connection(format!("Characteristic {} no longer present", wanted.uuid))
            })
    }
}

#[async_trait]
impl GattPeripheral for BtleplugPeripheral {
    async fn connect(&self) -> Result<()> {
        self.peripheral
            .connect()
            .await
            .map_err(|e| ble_error("connect", e))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| ble_error("disconnect", e))
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover(&self) -> Result<Vec<DiscoveredCharacteristic>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| ble_error("discover services", e))?;

        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| DiscoveredCharacteristic {
                service: c.service_uuid,
                uuid: c.uuid,
                properties: CharProps {
                    read: c.properties.contains(CharPropFlags::READ),
                    write: c.properties.contains(CharPropFlags::WRITE),
                    write_without_response: c
                        .properties
                        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    notify: c.properties.contains(CharPropFlags::NOTIFY),
                },
            })
            .collect())
    }

    async fn read(&self, characteristic: &DiscoveredCharacteristic) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .read(&c)
            .await
            .map_err(|e| ble_error("read", e))
    }

    async fn write(
        &self,
        characteristic: &DiscoveredCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&c, data, write_type)
            .await
            .map_err(|e| ble_error("write", e))
    }

    async fn notifications(
        &self,
        characteristic: &DiscoveredCharacteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(&c)
            .await
            .map_err(|e| ble_error("subscribe", e))?;
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| ble_error("notification stream", e))?;

        let uuid = c.uuid;
        Ok(stream
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| n.value)
            .boxed())
    }
}
