//! Bluetooth Transport Module
//!
//! Presents one [`BleLink`] as a [`DeviceTransport`]. The link serves exactly one
//! device, identified by its MAC address, so the listing is the configured device.
//! Every operation connects first when the link is not Ready and reconnects when a
//! Ready link has silently lost its peripheral.

use crate::domain::command::CommandRequest;
use crate::domain::models::{ConnectionState, DeviceStatus, DeviceSummary, DeviceType, SensorSample};
use crate::domain::settings::LocalSettings;
use crate::error::{ControlError, Result};
use crate::infrastructure::bluetooth::{
    connection::{BleLink, ConnectionConfig, Subscription},
    gatt::{BtleplugAdapter, GattAdapter},
    protocol::{ProtocolTable, StatusFrame},
};
use crate::infrastructure::transport::{DeviceListing, DeviceTransport};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// BLE-backed transport for a single controller
pub struct BleTransport {
    link: BleLink,
    device_name: String,
}

impl BleTransport {
    pub fn new(link: BleLink, device_name: impl Into<String>) -> Self {
        Self {
            link,
            device_name: device_name.into(),
        }
    }

    /// Open the first Bluetooth adapter and prepare a link to the configured address
    pub async fn from_settings(
        settings: &LocalSettings,
        table: Arc<ProtocolTable>,
        timeout: Duration,
    ) -> Result<Self> {
        let scan_window = Duration::from_millis(settings.scan_window_ms);
        let adapter: Arc<dyn GattAdapter> =
            Arc::new(BtleplugAdapter::first_available(scan_window).await?);

        let config = ConnectionConfig {
            address: settings.address.clone(),
            op_timeout: timeout,
            connect_timeout: scan_window + timeout,
        };
        Ok(Self::new(
            BleLink::new(config, table, adapter),
            settings.device_name.clone(),
        ))
    }

    pub fn link(&self) -> &BleLink {
        &self.link
    }

    /// Stream decoded sensor notifications to `callback`
    pub async fn subscribe<F>(&self, callback: F) -> Result<Subscription>
    where
        F: FnMut(SensorSample) + Send + 'static,
    {
        self.ensure_ready().await?;
        self.link.subscribe(callback).await
    }

    async fn ensure_ready(&self) -> Result<()> {
        if self.link.state() != ConnectionState::Ready {
            return self.link.connect().await;
        }
        if !self.link.is_link_alive().await {
            info!("Link to {} went stale, reconnecting", self.link.address());
            return self.link.reconnect().await;
        }
        Ok(())
    }

    fn check_target(&self, device_id: &str) -> Result<()> {
        if device_id.eq_ignore_ascii_case(self.link.address()) {
            Ok(())
        } else {
            Err(ControlError::Command(format!(
                "unknown device {device_id}; this link serves {}",
                self.link.address()
            )))
        }
    }
}

fn device_status(frame: StatusFrame, raw: Vec<u8>, sensors: SensorSample) -> DeviceStatus {
    DeviceStatus {
        power_state: frame.power_state,
        brightness: Some(frame.brightness),
        device_type: Some(frame.device_type),
        features: Some(frame.features),
        firmware_version: frame
            .firmware_version
            .map(|(major, minor, patch)| format!("{major}.{minor}.{patch}")),
        battery_percent: frame.battery_percent,
        sensors: Some(sensors),
        raw,
    }
}

#[async_trait]
impl DeviceTransport for BleTransport {
    /// The configured device; type and features are learned from its status
    async fn list_devices(&self) -> Result<DeviceListing> {
        Ok(DeviceListing {
            devices: vec![DeviceSummary {
                id: self.link.address().to_string(),
                name: self.device_name.clone(),
                device_type: DeviceType::Controller,
                features: BTreeSet::new(),
            }],
            removed: Vec::new(),
        })
    }

    async fn read_status(&self, device_id: &str) -> Result<DeviceStatus> {
        self.check_target(device_id)?;
        self.ensure_ready().await?;

        let (frame, raw) = self.link.read_status().await?;
        let sensors = self.link.read_sensors().await?;
        Ok(device_status(frame, raw, sensors))
    }

    async fn read_sensors(&self, device_id: &str) -> Result<SensorSample> {
        self.check_target(device_id)?;
        self.ensure_ready().await?;
        self.link.read_sensors().await
    }

    async fn send_command(&self, request: &CommandRequest) -> Result<()> {
        self.check_target(request.target_id())?;
        self.ensure_ready().await?;
        self.link.send_command(request).await
    }

    async fn probe(&self) -> Result<()> {
        self.ensure_ready().await
    }

    async fn close(&self) {
        self.link.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::{Opcode, Parameters};
    use crate::domain::models::{Feature, Percent, PowerState};
    use crate::infrastructure::bluetooth::gatt::fake::{FakeAdapter, FakePeripheral};
    use crate::infrastructure::bluetooth::protocol::Codec;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn transport() -> (BleTransport, Arc<FakePeripheral>) {
        let table = ProtocolTable::placeholder();
        let fake = Arc::new(FakePeripheral::new(table.clone()));
        let link = BleLink::new(
            ConnectionConfig {
                address: ADDRESS.into(),
                op_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(5),
            },
            Arc::new(table),
            Arc::new(FakeAdapter::new(fake.clone())),
        );
        (BleTransport::new(link, "Tent"), fake)
    }

    fn queue_status(fake: &FakePeripheral, temperature: f32) {
        let codec = Codec::new(Arc::new(ProtocolTable::placeholder()));
        let status = codec.encode_status(&StatusFrame {
            power_state: PowerState::On,
            brightness: Percent::new(60).unwrap(),
            device_type: DeviceType::Controller,
            features: [Feature::Lighting, Feature::Air].into_iter().collect(),
            firmware_version: Some((2, 0, 1)),
            battery_percent: Percent::new(90),
        });
        let sensors = codec.encode_sensors(&SensorSample {
            temperature: Some(temperature),
            ..Default::default()
        });
        let mut state = fake.state();
        state.status_reads.push_back(Ok(status));
        state.sensor_reads.push_back(Ok(sensors));
    }

    #[tokio::test]
    async fn test_listing_needs_no_radio() {
        let (transport, fake) = transport();
        let listing = transport.list_devices().await.unwrap();
        assert_eq!(listing.devices.len(), 1);
        assert_eq!(listing.devices[0].id, ADDRESS);
        assert_eq!(listing.devices[0].name, "Tent");
        assert_eq!(fake.state().connect_calls, 0);
    }

    #[tokio::test]
    async fn test_read_status_connects_first() {
        let (transport, fake) = transport();
        queue_status(&fake, 24.0);

        let status = transport.read_status(ADDRESS).await.unwrap();
        assert_eq!(transport.link().state(), ConnectionState::Ready);
        assert_eq!(status.power_state, PowerState::On);
        assert_eq!(status.firmware_version.as_deref(), Some("2.0.1"));
        assert_eq!(
            status.features,
            Some([Feature::Lighting, Feature::Air].into_iter().collect())
        );
        assert_eq!(status.sensors.and_then(|s| s.temperature), Some(24.0));
        assert!(!status.raw.is_empty());
    }

    #[tokio::test]
    async fn test_stale_link_is_reconnected() {
        let (transport, fake) = transport();
        queue_status(&fake, 20.0);
        transport.read_status(ADDRESS).await.unwrap();

        fake.drop_link();
        queue_status(&fake, 21.0);
        let status = transport.read_status(ADDRESS).await.unwrap();
        assert_eq!(status.sensors.and_then(|s| s.temperature), Some(21.0));
        assert_eq!(fake.state().connect_calls, 2);
    }

    #[tokio::test]
    async fn test_wrong_target_rejected_without_io() {
        let (transport, fake) = transport();
        let request = CommandRequest::new(
            "11:22:33:44:55:66",
            Opcode::SetFan,
            Parameters::new().with("speed", 10),
        )
        .unwrap();

        assert!(matches!(
            transport.send_command(&request).await,
            Err(ControlError::Command(_))
        ));
        assert_eq!(fake.state().connect_calls, 0);
    }

    #[tokio::test]
    async fn test_target_match_ignores_case() {
        let (transport, fake) = transport();
        queue_status(&fake, 22.0);
        transport
            .read_status(&ADDRESS.to_lowercase())
            .await
            .unwrap();
    }
}
