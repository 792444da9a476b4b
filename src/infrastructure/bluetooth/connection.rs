//! BLE Link
//!
//! Owns the connection to one grow controller: connect, service discovery,
//! status/sensor reads, command writes and the notification stream.
//!
//! The session sits behind an async mutex, so at most one request is in flight on
//! the radio and concurrent callers queue. [`BleLink::disconnect`] bumps a
//! cancellation epoch first, which fails any suspended request with a connection
//! error before the session is released.

use crate::domain::command::CommandRequest;
use crate::domain::models::{ConnectionState, SensorSample};
use crate::error::{ControlError, Result};
use crate::infrastructure::bluetooth::gatt::{
    DiscoveredCharacteristic, GattAdapter, GattPeripheral,
};
use crate::infrastructure::bluetooth::protocol::{Codec, ProtocolTable, StatusFrame};
use chrono::Utc;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device MAC address
    pub address: String,
    /// Bound on every read/write
    pub op_timeout: Duration,
    /// Bound on locating, connecting and discovering
    pub connect_timeout: Duration,
}

/// Characteristic handles cached after discovery
#[derive(Debug, Clone, Copy)]
struct CharacteristicHandles {
    command: DiscoveredCharacteristic,
    data: DiscoveredCharacteristic,
    configuration: DiscoveredCharacteristic,
    status: DiscoveredCharacteristic,
}

struct Session {
    peripheral: Arc<dyn GattPeripheral>,
    handles: CharacteristicHandles,
}

/// Handle for a running notification subscription
///
/// Dropping it stops delivery.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One physical connection to one device
pub struct BleLink {
    config: ConnectionConfig,
    codec: Codec,
    adapter: Arc<dyn GattAdapter>,
    session: Mutex<Option<Session>>,
    state: watch::Sender<ConnectionState>,
    disconnects: watch::Sender<u64>,
    subscriptions: std::sync::Mutex<Vec<AbortHandle>>,
}

impl BleLink {
    pub fn new(
        config: ConnectionConfig,
        table: Arc<ProtocolTable>,
        adapter: Arc<dyn GattAdapter>,
    ) -> Self {
        Self {
            config,
            codec: Codec::new(table),
            adapter,
            session: Mutex::new(None),
            state: watch::channel(ConnectionState::Disconnected).0,
            disconnects: watch::channel(0).0,
            subscriptions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect, discover services and cache the four characteristics
    ///
    /// A no-op when already Ready.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_some() && self.state() == ConnectionState::Ready {
            return Ok(());
        }
        self.establish(&mut slot).await
    }

    /// Tear down a Ready link and bring it back up
    pub async fn reconnect(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        if self.state() == ConnectionState::Ready {
            self.set_state(ConnectionState::Reconnecting);
        }
        if let Some(session) = slot.take() {
            self.release(&session.peripheral).await;
        }
        self.establish(&mut slot).await
    }

    /// Release the link; safe from any state
    pub async fn disconnect(&self) {
        self.disconnects.send_modify(|epoch| *epoch += 1);
        self.stop_subscriptions();

        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            self.release(&session.peripheral).await;
            info!("Disconnected from device {}", self.config.address);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Whether the radio still reports the peripheral as connected
    pub async fn is_link_alive(&self) -> bool {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(session) => session.peripheral.is_connected().await,
            None => false,
        }
    }

    /// Read and decode the status characteristic; returns the raw frame as well
    pub async fn read_status(&self) -> Result<(StatusFrame, Vec<u8>)> {
        let bytes = self
            .with_session("read status", |p, h| async move { p.read(&h.status).await })
            .await?;
        debug!("Status frame from {}: {:02X?}", self.config.address, bytes);

        let status = self.codec.decode_status(&bytes)?;
        Ok((status, bytes))
    }

    /// Read and decode the data characteristic
    pub async fn read_sensors(&self) -> Result<SensorSample> {
        let bytes = self
            .with_session("read sensors", |p, h| async move { p.read(&h.data).await })
            .await?;
        debug!("Sensor frame from {}: {:02X?}", self.config.address, bytes);

        let mut sample = self.codec.decode_sensors(&bytes)?;
        sample.captured_at = Some(Utc::now());
        Ok(sample)
    }

    /// Encode and write a command, with acknowledgment when the characteristic offers it
    pub async fn send_command(&self, request: &CommandRequest) -> Result<()> {
        let frame = self.codec.encode_request(request);
        info!(
            "Sending {} to {}: {:02X?}",
            request.opcode(),
            self.config.address,
            frame
        );

        self.with_session("send command", |p, h| async move {
            let props = h.command.properties;
            let with_response = props.write || !props.write_without_response;
            p.write(&h.command, &frame, with_response).await
        })
        .await
    }

    /// Deliver decoded sensor notifications to `callback`, in arrival order
    pub async fn subscribe<F>(&self, mut callback: F) -> Result<Subscription>
    where
        F: FnMut(SensorSample) + Send + 'static,
    {
        let mut stream = self
            .with_session("subscribe", |p, h| async move {
                p.notifications(&h.data).await
            })
            .await?;

        let codec = self.codec.clone();
        let address = self.config.address.clone();
        let task = tokio::spawn(async move {
            while let Some(bytes) = stream.next().await {
                match codec.decode_sensors(&bytes) {
                    Ok(mut sample) => {
                        sample.captured_at = Some(Utc::now());
                        callback(sample);
                    }
                    Err(e) => warn!("Dropping malformed notification from {}: {}", address, e),
                }
            }
            debug!("Notification stream from {} ended", address);
        });

        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.retain(|h| !h.is_finished());
            subs.push(task.abort_handle());
        }
        info!("Subscribed to sensor notifications from {}", self.config.address);
        Ok(Subscription { task })
    }

    async fn establish(&self, slot: &mut Option<Session>) -> Result<()> {
        info!("Connecting to device {}", self.config.address);
        self.set_state(ConnectionState::Connecting);

        let limit = self.config.connect_timeout;
        let mut attached = None;
        let result = self
            .guarded("connect", limit, self.open_session(&mut attached))
            .await;
        match result {
            Ok(session) => {
                *slot = Some(session);
                self.set_state(ConnectionState::Ready);
                info!("Device {} ready", self.config.address);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", self.config.address, e);
                if let Some(peripheral) = attached {
                    self.release(&peripheral).await;
                }
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// `attached` outlives this future, so a timed-out or cancelled connect
    /// can still release the peripheral
    async fn open_session(
        &self,
        attached: &mut Option<Arc<dyn GattPeripheral>>,
    ) -> Result<Session> {
        let peripheral = self.adapter.peripheral(&self.config.address).await?;
        *attached = Some(peripheral.clone());
        peripheral.connect().await?;

        self.set_state(ConnectionState::ServiceDiscovery);
        let discovered = peripheral.discover().await?;
        let handles = self.resolve_handles(&discovered)?;
        Ok(Session {
            peripheral,
            handles,
        })
    }

    fn resolve_handles(&self, discovered: &[DiscoveredCharacteristic]) -> Result<CharacteristicHandles> {
        let table = self.codec.table();
        if !discovered.iter().any(|c| c.service == table.service_uuid) {
            return Err(ControlError::ProtocolMismatch(format!(
                "service {} not found on {}",
                table.service_uuid, self.config.address
            )));
        }
        debug!("Discovered {} characteristics", discovered.len());

        let find = |uuid: Uuid, role: &str| {
            discovered
                .iter()
                .find(|c| c.service == table.service_uuid && c.uuid == uuid)
                .copied()
                .ok_or_else(|| {
                    ControlError::ProtocolMismatch(format!(
                        "{role} characteristic {uuid} missing on {}",
                        self.config.address
                    ))
                })
        };

        Ok(CharacteristicHandles {
            command: find(table.command_char_uuid, "command")?,
            data: find(table.data_char_uuid, "data")?,
            configuration: find(table.configuration_char_uuid, "configuration")?,
            status: find(table.status_char_uuid, "status")?,
        })
    }

    /// Run one request against the Ready session; any failure drops the link
    async fn with_session<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn GattPeripheral>, CharacteristicHandles) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut slot = self.session.lock().await;
        let (peripheral, handles) = match slot.as_ref() {
            Some(session) if self.state() == ConnectionState::Ready => {
                (session.peripheral.clone(), session.handles)
            }
            _ => {
                return Err(ControlError::Connection(format!(
                    "{op}: link to {} is {:?}",
                    self.config.address,
                    self.state()
                )))
            }
        };

        match self.guarded(op, self.config.op_timeout, f(peripheral, handles)).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("{} on {} failed, dropping link: {}", op, self.config.address, e);
                if let Some(session) = slot.take() {
                    self.release(&session.peripheral).await;
                }
                self.set_state(ConnectionState::Disconnected);
                Err(e.context(op))
            }
        }
    }

    /// Bound `fut` by `limit` and abort it on disconnect
    async fn guarded<T>(
        &self,
        op: &'static str,
        limit: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut cancelled = self.disconnects.subscribe();
        cancelled.borrow_and_update();

        tokio::select! {
            result = tokio::time::timeout(limit, fut) => {
                result.map_err(|_| ControlError::Timeout {
                    operation: op,
                    after: limit,
                })?
            }
            _ = cancelled.changed() => {
                Err(ControlError::Connection(format!("{op} cancelled by disconnect")))
            }
        }
    }

    async fn release(&self, peripheral: &Arc<dyn GattPeripheral>) {
        match tokio::time::timeout(self.config.op_timeout, peripheral.disconnect()).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error releasing {}: {}", self.config.address, e),
            Err(_) => warn!("Timed out releasing {}", self.config.address),
        }
    }

    fn stop_subscriptions(&self) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            for handle in subs.drain(..) {
                handle.abort();
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("Unexpected link transition {:?} -> {:?}", current, next);
        }
        debug!("Link {}: {:?} -> {:?}", self.config.address, current, next);
        self.state.send_replace(next);
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.stop_subscriptions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::{Opcode, Parameters};
    use crate::domain::models::{DeviceType, Percent, PowerState};
    use crate::infrastructure::bluetooth::gatt::fake::{FakeAdapter, FakePeripheral};
    use tokio::sync::{mpsc, Notify};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn table() -> ProtocolTable {
        ProtocolTable::placeholder()
    }

    fn link_with(peripheral: Arc<FakePeripheral>, timeout: Duration) -> BleLink {
        BleLink::new(
            ConnectionConfig {
                address: ADDRESS.into(),
                op_timeout: timeout,
                connect_timeout: Duration::from_secs(5),
            },
            Arc::new(table()),
            Arc::new(FakeAdapter::new(peripheral)),
        )
    }

    fn link(peripheral: Arc<FakePeripheral>) -> BleLink {
        link_with(peripheral, Duration::from_secs(5))
    }

    fn status_bytes() -> Vec<u8> {
        Codec::new(Arc::new(table())).encode_status(&StatusFrame {
            power_state: PowerState::On,
            brightness: Percent::new(70).unwrap(),
            device_type: DeviceType::Controller,
            features: Default::default(),
            firmware_version: Some((1, 3, 2)),
            battery_percent: None,
        })
    }

    #[tokio::test]
    async fn test_connect_passes_through_service_discovery() {
        let gate = Arc::new(Notify::new());
        let mut fake = FakePeripheral::new(table());
        fake.discovery_gate = Some(gate.clone());
        let link = Arc::new(link(Arc::new(fake)));
        let mut states = link.watch_state();

        let task = tokio::spawn({
            let link = link.clone();
            async move { link.connect().await }
        });

        states
            .wait_for(|s| *s == ConnectionState::ServiceDiscovery)
            .await
            .unwrap();
        assert_ne!(link.state(), ConnectionState::Ready);

        gate.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(link.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_protocol_mismatch() {
        let fake = Arc::new(FakePeripheral::new(table()));
        fake.state().omit_status_char = true;
        let link = link(fake.clone());

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, ControlError::ProtocolMismatch(msg) if msg.contains("status")));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!fake.state().connected);
    }

    #[tokio::test]
    async fn test_connect_failure_ends_disconnected() {
        let fake = Arc::new(FakePeripheral::new(table()));
        fake.state().fail_connect = true;
        let link = link(fake);

        assert!(matches!(link.connect().await, Err(ControlError::Connection(_))));
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let fake = Arc::new(FakePeripheral::new(table()));
        let link = link(fake.clone());

        link.disconnect().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);

        link.connect().await.unwrap();
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_eq!(fake.state().disconnect_calls, 1);
    }

    #[tokio::test]
    async fn test_operations_require_ready() {
        let fake = Arc::new(FakePeripheral::new(table()));
        let link = link(fake.clone());
        let request =
            CommandRequest::new(ADDRESS, Opcode::Power, Parameters::new().with("on", true))
                .unwrap();

        assert!(matches!(link.read_status().await, Err(ControlError::Connection(_))));
        assert!(matches!(
            link.send_command(&request).await,
            Err(ControlError::Connection(_))
        ));
        assert!(fake.state().writes.is_empty());
    }

    #[tokio::test]
    async fn test_read_status_and_sensors() {
        let fake = Arc::new(FakePeripheral::new(table()));
        let codec = Codec::new(Arc::new(table()));
        fake.state().status_reads.push_back(Ok(status_bytes()));
        fake.state().sensor_reads.push_back(Ok(codec.encode_sensors(&SensorSample {
            humidity: Some(55.0),
            ..Default::default()
        })));
        let link = link(fake);
        link.connect().await.unwrap();

        let (status, raw) = link.read_status().await.unwrap();
        assert_eq!(status.power_state, PowerState::On);
        assert_eq!(status.firmware_version, Some((1, 3, 2)));
        assert_eq!(raw, status_bytes());

        let sample = link.read_sensors().await.unwrap();
        assert_eq!(sample.humidity, Some(55.0));
        assert!(sample.captured_at.is_some());
    }

    #[tokio::test]
    async fn test_malformed_status_keeps_link() {
        let fake = Arc::new(FakePeripheral::new(table()));
        fake.state().status_reads.push_back(Ok(vec![0x01, 0x00]));
        let link = link(fake);
        link.connect().await.unwrap();

        assert!(matches!(link.read_status().await, Err(ControlError::Parse(_))));
        assert_eq!(link.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_read_failure_drops_link() {
        let fake = Arc::new(FakePeripheral::new(table()));
        fake.state()
            .status_reads
            .push_back(Err(ControlError::Connection("radio gone".into())));
        let link = link(fake.clone());
        link.connect().await.unwrap();

        let err = link.read_status().await.unwrap_err();
        assert!(matches!(err, ControlError::Connection(msg) if msg.contains("read status")));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_eq!(fake.state().disconnect_calls, 1);
    }

    #[tokio::test]
    async fn test_send_command_writes_frame() {
        let fake = Arc::new(FakePeripheral::new(table()));
        let link = link(fake.clone());
        link.connect().await.unwrap();

        let request = CommandRequest::new(
            ADDRESS,
            Opcode::SetLight,
            Parameters::new().with("intensity", 50),
        )
        .unwrap();
        link.send_command(&request).await.unwrap();

        let writes = fake.state().writes.clone();
        assert_eq!(
            writes,
            vec![(table().command_char_uuid, vec![0x10, 0x32], true)]
        );
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_pending_read() {
        let mut fake = FakePeripheral::new(table());
        fake.read_gate = Some(Arc::new(Notify::new()));
        let link = Arc::new(link(Arc::new(fake)));
        link.connect().await.unwrap();

        let pending = tokio::spawn({
            let link = link.clone();
            async move { link.read_status().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        link.disconnect().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ControlError::Connection(_))));
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let mut fake = FakePeripheral::new(table());
        fake.read_gate = Some(Arc::new(Notify::new()));
        let link = link_with(Arc::new(fake), Duration::from_millis(30));
        link.connect().await.unwrap();

        let err = link.read_sensors().await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout { operation: "read sensors", .. }));
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let fake = Arc::new(FakePeripheral::new(table()));
        let codec = Codec::new(Arc::new(table()));
        let link = link(fake.clone());
        link.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = link
            .subscribe(move |sample| {
                let _ = tx.send(sample.temperature);
            })
            .await
            .unwrap();

        for t in [20.0, 21.0] {
            fake.push_notification(codec.encode_sensors(&SensorSample {
                temperature: Some(t),
                ..Default::default()
            }));
        }
        fake.push_notification(vec![0x02, 0x01, 0x00]);
        fake.push_notification(codec.encode_sensors(&SensorSample {
            temperature: Some(22.0),
            ..Default::default()
        }));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![Some(20.0), Some(21.0), Some(22.0)]);
        assert!(subscription.is_active());

        link.disconnect().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_timeout_releases_peripheral() {
        let mut fake = FakePeripheral::new(table());
        fake.discovery_gate = Some(Arc::new(Notify::new()));
        let fake = Arc::new(fake);
        let link = BleLink::new(
            ConnectionConfig {
                address: ADDRESS.into(),
                op_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_millis(50),
            },
            Arc::new(table()),
            Arc::new(FakeAdapter::new(fake.clone())),
        );

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, ControlError::Timeout { operation: "connect", .. }));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!fake.state().connected);
        assert_eq!(fake.state().disconnect_calls, 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_discovery_releases_peripheral() {
        let mut fake = FakePeripheral::new(table());
        fake.discovery_gate = Some(Arc::new(Notify::new()));
        let fake = Arc::new(fake);
        let link = Arc::new(link(fake.clone()));
        let mut states = link.watch_state();

        let connecting = tokio::spawn({
            let link = link.clone();
            async move { link.connect().await }
        });
        states
            .wait_for(|s| *s == ConnectionState::ServiceDiscovery)
            .await
            .unwrap();

        link.disconnect().await;
        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(ControlError::Connection(_))));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!fake.state().connected);
    }

    #[tokio::test]
    async fn test_concurrent_requests_queue() {
        let gate = Arc::new(Notify::new());
        let mut fake = FakePeripheral::new(table());
        fake.read_gate = Some(gate.clone());
        let fake = Arc::new(fake);
        fake.state().status_reads.push_back(Ok(status_bytes()));
        let link = Arc::new(link(fake.clone()));
        link.connect().await.unwrap();

        let read = tokio::spawn({
            let link = link.clone();
            async move { link.read_status().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let write = tokio::spawn({
            let link = link.clone();
            async move {
                let request = CommandRequest::new(
                    ADDRESS,
                    Opcode::SetFan,
                    Parameters::new().with("speed", 30),
                )
                .unwrap();
                link.send_command(&request).await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!write.is_finished());
        assert!(fake.state().writes.is_empty());

        gate.notify_one();
        let (status, _) = read.await.unwrap().unwrap();
        assert_eq!(status.power_state, PowerState::On);
        write.await.unwrap().unwrap();
        assert_eq!(fake.state().writes.len(), 1);
        assert_eq!(link.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_write_failure_drops_link() {
        let fake = Arc::new(FakePeripheral::new(table()));
        let link = link(fake.clone());
        link.connect().await.unwrap();
        fake.state().fail_writes = true;

        let request =
            CommandRequest::new(ADDRESS, Opcode::Power, Parameters::new().with("on", false))
                .unwrap();
        let err = link.send_command(&request).await.unwrap_err();
        assert!(matches!(err, ControlError::Connection(msg) if msg.contains("send command")));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!fake.state().connected);
    }

    #[tokio::test]
    async fn test_reconnect_cycles_link() {
        let fake = Arc::new(FakePeripheral::new(table()));
        let link = link(fake.clone());
        link.connect().await.unwrap();

        link.reconnect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Ready);
        assert_eq!(fake.state().connect_calls, 2);
        assert_eq!(fake.state().disconnect_calls, 1);
    }
}
