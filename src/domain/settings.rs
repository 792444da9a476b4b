use crate::infrastructure::bluetooth::protocol::ProtocolTable;
use crate::infrastructure::cloud::CloudContract;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
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
    "marspro_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Direct BLE link to one controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSettings {
    /// MAC address, also used as the device id
    pub address: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// How long to listen for advertisements when locating the device
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
}

fn default_device_name() -> String {
    "MarsPro Controller".to_string()
}
fn default_scan_window_ms() -> u64 {
    5000
}

/// Vendor cloud account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub contract: CloudContract,
}

fn default_base_url() -> String {
    "https://api.marspro.com".to_string()
}
fn default_api_version() -> String {
    "v1".to_string()
}

/// Which transport to build; chosen once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSettings {
    Local(LocalSettings),
    Cloud(CloudSettings),
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::Local(LocalSettings {
            address: String::new(),
            device_name: default_device_name(),
            scan_window_ms: default_scan_window_ms(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub transport: TransportSettings,

    // Polling
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Wire protocol revision for the BLE link
    #[serde(default)]
    pub protocol: ProtocolTable,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            protocol: ProtocolTable::default(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    10
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject settings the transports cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.transport {
            TransportSettings::Local(local) => {
                if local.address.trim().is_empty() {
                    anyhow::bail!("Local transport needs a device address");
                }
            }
            TransportSettings::Cloud(cloud) => {
                if cloud.email.trim().is_empty() || cloud.password.is_empty() {
                    anyhow::bail!("Cloud transport needs an email and password");
                }
                if !cloud.base_url.starts_with("http://") && !cloud.base_url.starts_with("https://")
                {
                    anyhow::bail!("Cloud base URL must be http(s): {}", cloud.base_url);
                }
            }
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("Poll interval must be at least one second");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be at least one second");
        }
        self.protocol
            .validate()
            .context("Invalid protocol table")?;
        Ok(())
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    /// Load an explicit settings file; a missing or malformed file is an error
    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = path.into();
        let settings = Self::load_from_file(&settings_path)
            .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("MarsProController");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> Settings {
        Settings {
            transport: TransportSettings::Cloud(CloudSettings {
                base_url: default_base_url(),
                api_version: default_api_version(),
                email: "grower@example.com".into(),
                password: "secret".into(),
                contract: CloudContract::default(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: Settings = serde_json::from_str(
            r#"{"transport": {"kind": "local", "address": "AA:BB:CC:DD:EE:FF"}}"#,
        )
        .unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_secs(30));
        assert_eq!(settings.request_timeout(), Duration::from_secs(10));
        assert_eq!(settings.protocol, ProtocolTable::placeholder());
        match &settings.transport {
            TransportSettings::Local(local) => {
                assert_eq!(local.scan_window_ms, 5000);
                assert_eq!(local.device_name, "MarsPro Controller");
            }
            other => panic!("unexpected transport {other:?}"),
        }
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(Settings::default().validate().is_err());

        let mut settings = cloud();
        settings.validate().unwrap();
        settings.poll_interval_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = cloud();
        settings.protocol.opcodes.set_fan = settings.protocol.opcodes.set_light;
        assert!(settings.validate().is_err());

        let mut settings = cloud();
        if let TransportSettings::Cloud(c) = &mut settings.transport {
            c.password.clear();
        }
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService {
            settings: cloud(),
            settings_path: path.clone(),
        };
        service.get_mut().poll_interval_secs = 45;
        service.save().unwrap();

        let loaded = SettingsService::load_from(&path).unwrap();
        assert_eq!(loaded.get(), service.get());
        assert_eq!(loaded.path(), path.as_path());
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SettingsService::load_from(dir.path().join("absent.json")).is_err());
    }
}
