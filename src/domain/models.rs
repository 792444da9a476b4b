use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of unit reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Controller,
    Sensor,
    Actuator,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Sensor => "sensor",
            Self::Actuator => "actuator",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "controller" => Some(Self::Controller),
            "sensor" => Some(Self::Sensor),
            "actuator" => Some(Self::Actuator),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability tag advertised by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Lighting,
    Climate,
    Water,
    Air,
    Heating,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Lighting,
        Feature::Climate,
        Feature::Water,
        Feature::Air,
        Feature::Heating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lighting => "lighting",
            Self::Climate => "climate",
            Self::Water => "water",
            Self::Air => "air",
            Self::Heating => "heating",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

/// A value guaranteed to lie in 0..=100
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Percent(u8);

impl Percent {
    pub const MAX: Percent = Percent(100);

    pub fn new(value: u8) -> Option<Self> {
        (value <= 100).then_some(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Percent {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("{value} is not a percentage"))
    }
}

impl From<Percent> for u8 {
    fn from(p: Percent) -> u8 {
        p.0
    }
}

/// One set of environmental readings; every field may be absent
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorSample {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub co2: Option<f32>,
    pub vpd: Option<f32>,
    pub ppfd: Option<f32>,
    pub wind_speed: Option<f32>,
    pub wind_pressure: Option<f32>,
    pub air_volume: Option<f32>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl SensorSample {
    /// True when the sample carries no readings at all
    pub fn is_empty(&self) -> bool {
        self.readings().iter().all(Option::is_none)
    }

    /// Readings in wire order
    pub fn readings(&self) -> [Option<f32>; 8] {
        [
            self.temperature,
            self.humidity,
            self.co2,
            self.vpd,
            self.ppfd,
            self.wind_speed,
            self.wind_pressure,
            self.air_volume,
        ]
    }

    /// Build a sample from readings in wire order
    pub fn from_readings(readings: [Option<f32>; 8]) -> Self {
        let [temperature, humidity, co2, vpd, ppfd, wind_speed, wind_pressure, air_volume] =
            readings;
        Self {
            temperature,
            humidity,
            co2,
            vpd,
            ppfd,
            wind_speed,
            wind_pressure,
            air_volume,
            captured_at: None,
        }
    }
}

/// What a device listing reports about one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub features: BTreeSet<Feature>,
}

/// Result of one successful status read
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceStatus {
    pub power_state: PowerState,
    pub brightness: Option<Percent>,
    pub device_type: Option<DeviceType>,
    pub features: Option<BTreeSet<Feature>>,
    pub firmware_version: Option<String>,
    pub battery_percent: Option<Percent>,
    pub sensors: Option<SensorSample>,
    pub raw: Vec<u8>,
}

/// Host-visible view of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub features: BTreeSet<Feature>,
    pub power_state: PowerState,
    pub brightness: Option<Percent>,
    pub firmware_version: Option<String>,
    pub battery_percent: Option<Percent>,
    pub sensors: SensorSample,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
}

impl DeviceRecord {
    /// Create a record from its first listing; status fields start unknown
    pub fn from_summary(summary: &DeviceSummary) -> Self {
        Self {
            id: summary.id.clone(),
            name: summary.name.clone(),
            device_type: summary.device_type,
            features: summary.features.clone(),
            power_state: PowerState::Unknown,
            brightness: None,
            firmware_version: None,
            battery_percent: None,
            sensors: SensorSample::default(),
            last_seen: None,
            raw: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Refresh listing-level fields; the id never changes
    pub fn apply_summary(&mut self, summary: &DeviceSummary) {
        debug_assert_eq!(self.id, summary.id);
        self.name = summary.name.clone();
        self.device_type = summary.device_type;
        if !summary.features.is_empty() {
            self.features = summary.features.clone();
        }
    }

    /// Merge a successful status read
    pub fn apply_status(&mut self, status: DeviceStatus, seen_at: DateTime<Utc>) {
        self.power_state = status.power_state;
        self.brightness = status.brightness;
        if let Some(device_type) = status.device_type {
            self.device_type = device_type;
        }
        if let Some(features) = status.features {
            self.features = features;
        }
        self.firmware_version = status.firmware_version;
        self.battery_percent = status.battery_percent;
        if let Some(mut sensors) = status.sensors {
            sensors.captured_at.get_or_insert(seen_at);
            self.sensors = sensors;
        }
        self.raw = status.raw;
        self.last_seen = Some(seen_at);
    }
}

/// BLE link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
    Reconnecting,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal step
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, ServiceDiscovery)
                | (ServiceDiscovery, Ready)
                | (Ready, Reconnecting)
                | (Reconnecting, Connecting)
                | (_, Disconnected)
        )
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        serializer.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(deserializer)?;
        if !hex.is_ascii() || hex.len() % 2 != 0 {
            return Err(serde::de::Error::custom("expected an even-length hex string"));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(serde::de::Error::custom))
            .collect()
    }
}
