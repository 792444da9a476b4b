//! Device Coordinator
//!
//! Polls the transport, merges results into the [`Registry`] and runs commands.
//!
//! ```text
//!   idle ──(interval tick / command ack)──► polling ──► idle
//!
//!   refresh:  list_devices ──► read_status per device ──► publish snapshot
//!                  │                   │
//!                  │ fails             │ fails for one device
//!                  ▼                   ▼
//!          UpdateFailed,        keep its last record,
//!          registry untouched   report it as stale
//! ```
//!
//! Refreshes and command-then-refresh sequences hold the cycle lock, so a
//! command's follow-up refresh always observes the acknowledged command.

use crate::domain::command::{CommandRequest, NamedCommand, Opcode, Parameters};
use crate::domain::models::{DeviceRecord, DeviceType};
use crate::domain::registry::Registry;
use crate::error::{ControlError, Result};
use crate::infrastructure::transport::DeviceTransport;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Polling,
}

/// Outcome of one refresh cycle
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefreshReport {
    /// Devices whose status read succeeded
    pub updated: Vec<String>,
    /// Devices that kept their previous record, with the read error
    pub stale: Vec<(String, ControlError)>,
    /// Devices dropped on the transport's removal notice
    pub removed: Vec<String>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.stale.is_empty()
    }
}

/// Outcome of a successful command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReport {
    pub request: CommandRequest,
    /// The follow-up refresh; its failure does not undo the command
    pub refresh: Result<RefreshReport>,
}

pub struct DeviceCoordinator {
    transport: Arc<dyn DeviceTransport>,
    registry: watch::Sender<Arc<Registry>>,
    state: watch::Sender<CoordinatorState>,
    cycle: Mutex<()>,
}

impl DeviceCoordinator {
    pub fn new(transport: Arc<dyn DeviceTransport>) -> Self {
        Self {
            transport,
            registry: watch::channel(Arc::new(Registry::default())).0,
            state: watch::channel(CoordinatorState::Idle).0,
            cycle: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.transport
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Current registry; never blocks, never does I/O
    pub fn snapshot(&self) -> Arc<Registry> {
        self.registry.borrow().clone()
    }

    /// Receive every published registry
    pub fn subscribe(&self) -> watch::Receiver<Arc<Registry>> {
        self.registry.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.registry.borrow().get(id).cloned()
    }

    pub fn list(&self) -> Vec<DeviceRecord> {
        self.registry.borrow().list().into_iter().cloned().collect()
    }

    pub fn list_by_type(&self, device_type: DeviceType) -> Vec<DeviceRecord> {
        self.registry
            .borrow()
            .list_by_type(device_type)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Run one poll cycle
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let _cycle = self.cycle.lock().await;
        self.poll().await
    }

    /// Validate, send, then refresh once
    ///
    /// Schema and feature checks happen before any I/O. A failing refresh is
    /// reported in [`CommandReport::refresh`] and never turns the command into
    /// an error.
    pub async fn send_command(
        &self,
        target_id: &str,
        opcode: Opcode,
        parameters: Parameters,
    ) -> Result<CommandReport> {
        let request = CommandRequest::new(target_id, opcode, parameters)?;
        self.check_supported(&request)?;

        let _cycle = self.cycle.lock().await;
        self.transport.send_command(&request).await?;
        info!("{} acknowledged by {}", opcode, target_id);

        let refresh = self.poll().await;
        if let Err(e) = &refresh {
            warn!("Refresh after {} on {} failed: {}", opcode, target_id, e);
        }
        Ok(CommandReport { request, refresh })
    }

    /// [`send_command`](Self::send_command) by name, accepting `power_on`/`power_off`
    pub async fn send_named(
        &self,
        target_id: &str,
        command: &str,
        parameters: Parameters,
    ) -> Result<CommandReport> {
        let named: NamedCommand = command.parse()?;
        self.send_command(target_id, named.opcode, named.parameters(parameters))
            .await
    }

    /// Poll every `interval` until `shutdown` resolves; cycle errors are logged
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Polling every {:?}", interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Polling stopped");
                    break;
                }
                _ = ticker.tick() => match self.refresh().await {
                    Ok(report) => debug!(
                        "Cycle done: {} updated, {} stale, {} removed",
                        report.updated.len(),
                        report.stale.len(),
                        report.removed.len()
                    ),
                    Err(e) => error!("Refresh cycle failed: {}", e),
                },
            }
        }
    }

    fn check_supported(&self, request: &CommandRequest) -> Result<()> {
        let registry = self.registry.borrow();
        let record = registry.get(request.target_id()).ok_or_else(|| {
            ControlError::Command(format!("unknown device {}", request.target_id()))
        })?;

        // An empty feature set means the device has not reported its capabilities yet
        if let Some(feature) = request.opcode().required_feature() {
            if !record.features.is_empty() && !record.features.contains(&feature) {
                return Err(ControlError::Command(format!(
                    "{} needs the {} feature, which {} does not have",
                    request.opcode(),
                    feature.as_str(),
                    request.target_id()
                )));
            }
        }
        Ok(())
    }

    /// Caller holds the cycle lock
    async fn poll(&self) -> Result<RefreshReport> {
        self.state.send_replace(CoordinatorState::Polling);
        let _idle = IdleOnDrop(&self.state);
        self.collect().await
    }

    async fn collect(&self) -> Result<RefreshReport> {
        let listing = self.transport.list_devices().await.map_err(|e| {
            error!("Device listing failed, keeping registry: {}", e);
            ControlError::UpdateFailed(e.to_string())
        })?;

        let mut next = Registry::clone(&self.snapshot());
        let mut report = RefreshReport::default();

        for id in &listing.removed {
            if next.remove(id).is_some() {
                info!("Device {} removed", id);
                report.removed.push(id.clone());
            }
        }

        for summary in &listing.devices {
            if listing.removed.contains(&summary.id) {
                continue;
            }
            match self.transport.read_status(&summary.id).await {
                Ok(status) => {
                    next.upsert(summary).apply_status(status, Utc::now());
                    report.updated.push(summary.id.clone());
                }
                Err(e) => {
                    warn!("Status read for {} failed, keeping last record: {}", summary.id, e);
                    next.insert_if_absent(summary);
                    report.stale.push((summary.id.clone(), e));
                }
            }
        }

        self.registry.send_replace(Arc::new(next));
        Ok(report)
    }
}

/// Returns the coordinator to Idle even when a cycle is dropped midway
struct IdleOnDrop<'a>(&'a watch::Sender<CoordinatorState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(CoordinatorState::Idle);
    }
}
