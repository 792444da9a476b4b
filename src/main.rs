//! CLI entry point for marspro_controller
//!
//! ```bash
//! marspro_controller run                       # poll until Ctrl-C
//! marspro_controller refresh                   # one cycle, registry as JSON
//! marspro_controller send AA:BB:.. set_light intensity=50
//! marspro_controller send dev-1 power_off
//! marspro_controller scan --window-ms 8000     # find controllers nearby
//! marspro_controller watch                     # stream BLE sensor notifications
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marspro_controller::domain::command::{ParamValue, Parameters};
use marspro_controller::domain::coordinator::{DeviceCoordinator, RefreshReport};
use marspro_controller::domain::settings::SettingsService;
use marspro_controller::infrastructure::bluetooth::gatt::BtleplugAdapter;
use marspro_controller::infrastructure::bluetooth::scanner::BleScanner;
use marspro_controller::infrastructure::logging::init_logger;
use marspro_controller::infrastructure::transport::{DeviceTransport, TransportFacade};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "marspro_controller")]
#[command(about = "Control MarsPro grow controllers over BLE or the cloud", long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll on the configured interval until Ctrl-C
    Run,

    /// Run one refresh cycle and print the registry
    Refresh,

    /// Send one command, then refresh
    Send {
        /// Device id (MAC address for BLE)
        device_id: String,

        /// Opcode name, or power_on / power_off
        command: String,

        /// Parameters as key=value
        params: Vec<String>,
    },

    /// Scan for nearby controllers
    Scan {
        #[arg(long, default_value = "5000")]
        window_ms: u64,
    },

    /// Print sensor notifications from the BLE device until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_service = match &cli.config {
        Some(path) => SettingsService::load_from(path.clone())?,
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Settings loaded from {}", settings_service.path().display());

    if let Commands::Scan { window_ms } = cli.command {
        settings.protocol.validate().context("Invalid protocol table")?;
        return scan(Duration::from_millis(window_ms), &settings.protocol.service_uuid).await;
    }

    settings.validate()?;
    let facade = Arc::new(
        TransportFacade::from_settings(&settings)
            .await
            .context("Failed to open transport")?,
    );

    let result = match cli.command {
        Commands::Run => run(facade.clone(), settings.poll_interval()).await,
        Commands::Refresh => refresh(facade.clone()).await,
        Commands::Send {
            device_id,
            command,
            params,
        } => send(facade.clone(), &device_id, &command, &params).await,
        Commands::Watch => watch(&facade).await,
        Commands::Scan { .. } => Ok(()),
    };

    facade.close().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run(facade: Arc<TransportFacade>, interval: Duration) -> Result<()> {
    let coordinator = DeviceCoordinator::new(facade);
    coordinator.run(interval, shutdown_signal()).await;
    Ok(())
}

async fn refresh(facade: Arc<TransportFacade>) -> Result<()> {
    let coordinator = DeviceCoordinator::new(facade);
    let report = coordinator.refresh().await?;
    print_report(&report);
    println!("{}", serde_json::to_string_pretty(&*coordinator.snapshot())?);
    Ok(())
}

async fn send(
    facade: Arc<TransportFacade>,
    device_id: &str,
    command: &str,
    params: &[String],
) -> Result<()> {
    let parameters = parse_params(params)?;
    let coordinator = DeviceCoordinator::new(facade);
    // populate the registry so the feature check knows the device
    let initial = coordinator.refresh().await?;
    print_report(&initial);

    let report = coordinator.send_named(device_id, command, parameters).await?;
    println!("{} accepted by {}", report.request.opcode(), device_id);
    match &report.refresh {
        Ok(refresh) => print_report(refresh),
        Err(e) => eprintln!("Command succeeded, but the follow-up refresh failed: {e}"),
    }
    if let Some(record) = coordinator.get(device_id) {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Ok(())
}

async fn scan(window: Duration, service_uuid: &uuid::Uuid) -> Result<()> {
    let adapter = BtleplugAdapter::first_available(window).await?;
    let scanner = BleScanner::new(Arc::new(adapter), *service_uuid);
    let devices = scanner.scan(window).await?;

    if devices.is_empty() {
        println!("No controllers found");
    }
    for device in devices {
        println!(
            "{}  {:<24} rssi={:>4}  {}",
            device.address,
            device.name,
            device
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".into()),
            if device.advertises_service {
                "service"
            } else {
                "name match"
            }
        );
    }
    Ok(())
}

async fn watch(facade: &TransportFacade) -> Result<()> {
    let local = facade
        .as_local()
        .context("watch needs the local BLE transport")?;

    let _subscription = local
        .subscribe(|sample| match serde_json::to_string(&sample) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("Could not print sample: {}", e),
        })
        .await?;
    info!("Watching {}; Ctrl-C to stop", local.link().address());

    shutdown_signal().await;
    Ok(())
}

fn parse_params(params: &[String]) -> Result<Parameters> {
    let mut parameters = Parameters::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("Expected key=value, got {param:?}"))?;
        let value = ParamValue::parse_literal(value)
            .with_context(|| format!("Cannot parse value of {key}: {value:?}"))?;
        parameters.insert(key.trim(), value);
    }
    Ok(parameters)
}

fn print_report(report: &RefreshReport) {
    eprintln!(
        "Refresh: {} updated, {} stale, {} removed",
        report.updated.len(),
        report.stale.len(),
        report.removed.len()
    );
    for (id, err) in &report.stale {
        eprintln!("  {id}: {err}");
    }
}
