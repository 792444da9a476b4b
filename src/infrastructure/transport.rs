//! Transport Facade
//!
//! One operation set over either transport. The choice is made once, from
//! settings, when the facade is built.
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │ TransportFacade  │
//!                 └────────┬─────────┘
//!            ┌─────────────┴─────────────┐
//!            ▼                           ▼
//!   ┌─────────────────┐         ┌─────────────────┐
//!   │  BleTransport   │         │    CloudLink    │
//!   │  (one BleLink)  │         │  (HTTP session) │
//!   └─────────────────┘         └─────────────────┘
//! ```
//!
//! The facade never retries. It adds the transport name to errors and passes
//! them on.

use crate::domain::command::CommandRequest;
use crate::domain::models::{DeviceStatus, DeviceSummary, SensorSample};
use crate::domain::settings::{Settings, TransportSettings};
use crate::error::Result;
use crate::infrastructure::bluetooth::BleTransport;
use crate::infrastructure::cloud::CloudLink;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Result of one device listing
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceListing {
    pub devices: Vec<DeviceSummary>,
    /// Ids the transport reports as deleted
    pub removed: Vec<String>,
}

/// Operations every transport offers
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn list_devices(&self) -> Result<DeviceListing>;

    async fn read_status(&self, device_id: &str) -> Result<DeviceStatus>;

    async fn read_sensors(&self, device_id: &str) -> Result<SensorSample>;

    async fn send_command(&self, request: &CommandRequest) -> Result<()>;

    /// Connect or authenticate without touching any device
    async fn probe(&self) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
impl DeviceTransport for CloudLink {
    async fn list_devices(&self) -> Result<DeviceListing> {
        CloudLink::list_devices(self).await
    }

    async fn read_status(&self, device_id: &str) -> Result<DeviceStatus> {
        CloudLink::read_status(self, device_id).await
    }

    async fn read_sensors(&self, device_id: &str) -> Result<SensorSample> {
        CloudLink::read_sensors(self, device_id).await
    }

    async fn send_command(&self, request: &CommandRequest) -> Result<()> {
        CloudLink::send_command(self, request).await
    }

    async fn probe(&self) -> Result<()> {
        CloudLink::probe(self).await
    }

    async fn close(&self) {
        CloudLink::close(self).await
    }
}

/// The configured transport
pub enum TransportFacade {
    Local(BleTransport),
    Cloud(CloudLink),
}

impl TransportFacade {
    /// Build the transport named in `settings`
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout = settings.request_timeout();
        match &settings.transport {
            TransportSettings::Local(local) => {
                info!("Using local BLE transport to {}", local.address);
                let table = Arc::new(settings.protocol.clone());
                Ok(Self::Local(
                    BleTransport::from_settings(local, table, timeout).await?,
                ))
            }
            TransportSettings::Cloud(cloud) => {
                info!("Using cloud transport at {}", cloud.base_url);
                Ok(Self::Cloud(CloudLink::new(cloud, timeout)?))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "ble",
            Self::Cloud(_) => "cloud",
        }
    }

    /// The BLE transport, when that is the one configured
    pub fn as_local(&self) -> Option<&BleTransport> {
        match self {
            Self::Local(local) => Some(local),
            Self::Cloud(_) => None,
        }
    }

    fn inner(&self) -> &dyn DeviceTransport {
        match self {
            Self::Local(local) => local as &dyn DeviceTransport,
            Self::Cloud(cloud) => cloud,
        }
    }
}

#[async_trait]
impl DeviceTransport for TransportFacade {
    async fn list_devices(&self) -> Result<DeviceListing> {
        self.inner()
            .list_devices()
            .await
            .map_err(|e| e.context(self.kind()))
    }

    async fn read_status(&self, device_id: &str) -> Result<DeviceStatus> {
        self.inner()
            .read_status(device_id)
            .await
            .map_err(|e| e.context(self.kind()))
    }

    async fn read_sensors(&self, device_id: &str) -> Result<SensorSample> {
        self.inner()
            .read_sensors(device_id)
            .await
            .map_err(|e| e.context(self.kind()))
    }

    async fn send_command(&self, request: &CommandRequest) -> Result<()> {
        self.inner()
            .send_command(request)
            .await
            .map_err(|e| e.context(self.kind()))
    }

    async fn probe(&self) -> Result<()> {
        self.inner()
            .probe()
            .await
            .map_err(|e| e.context(self.kind()))
    }

    async fn close(&self) {
        self.inner().close().await
    }
}
