//! Cloud payload contract
//!
//! Field names of the vendor API are configuration, not code. [`CloudContract`]
//! carries them, and the functions here turn JSON bodies into typed values with it.
//! Parsing is exposed separately from the HTTP client so payload shapes can be
//! tested without a server.

use crate::domain::command::CommandRequest;
use crate::domain::models::{
    DeviceStatus, DeviceSummary, DeviceType, Feature, Percent, PowerState, SensorSample,
};
use crate::error::ParseError;
use crate::infrastructure::transport::DeviceListing;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

/// JSON field names used by one revision of the cloud API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudContract {
    pub email_field: String,
    pub password_field: String,
    pub token_field: String,
    pub devices_field: String,
    /// Optional list of ids the server reports as deleted
    pub removed_field: String,
    pub id_field: String,
    pub name_field: String,
    pub type_field: String,
    pub features_field: String,
    pub power_field: String,
    pub brightness_field: String,
    pub firmware_field: String,
    pub battery_field: String,
    pub sensors_field: String,
    pub device_id_field: String,
    pub command_field: String,
    /// Boolean in the control response; absent means success
    pub success_field: String,
    pub message_field: String,
    /// Keys inside the sensors object
    pub sensor_keys: SensorKeys,
}

/// Key of each reading inside the status response's sensors object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorKeys {
    pub temperature: String,
    pub humidity: String,
    pub co2: String,
    pub vpd: String,
    pub ppfd: String,
    pub wind_speed: String,
    pub wind_pressure: String,
    pub air_volume: String,
}

impl Default for SensorKeys {
    fn default() -> Self {
        let [temperature, humidity, co2, vpd, ppfd, wind_speed, wind_pressure, air_volume] =
            READINGS.map(str::to_string);
        Self {
            temperature,
            humidity,
            co2,
            vpd,
            ppfd,
            wind_speed,
            wind_pressure,
            air_volume,
        }
    }
}

impl SensorKeys {
    /// Keys in the order of [`SensorSample::readings`]
    fn in_wire_order(&self) -> [&str; 8] {
        [
            self.temperature.as_str(),
            self.humidity.as_str(),
            self.co2.as_str(),
            self.vpd.as_str(),
            self.ppfd.as_str(),
            self.wind_speed.as_str(),
            self.wind_pressure.as_str(),
            self.air_volume.as_str(),
        ]
    }
}

impl Default for CloudContract {
    fn default() -> Self {
        let s = |v: &str| v.to_string();
        Self {
            email_field: s("email"),
            password_field: s("password"),
            token_field: s("token"),
            devices_field: s("devices"),
            removed_field: s("removed"),
            id_field: s("id"),
            name_field: s("name"),
            type_field: s("type"),
            features_field: s("features"),
            power_field: s("power"),
            brightness_field: s("brightness"),
            firmware_field: s("firmware_version"),
            battery_field: s("battery"),
            sensors_field: s("sensors"),
            device_id_field: s("device_id"),
            command_field: s("command"),
            success_field: s("success"),
            message_field: s("message"),
            sensor_keys: SensorKeys::default(),
        }
    }
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ParseError> {
    value
        .as_object()
        .ok_or_else(|| ParseError::Json(format!("{what} is not an object")))
}

fn invalid(field: &'static str, value: &Value) -> ParseError {
    ParseError::InvalidField {
        field,
        value: value.to_string(),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl CloudContract {
    pub fn login_body(&self, email: &str, password: &str) -> Value {
        let mut body = Map::new();
        body.insert(self.email_field.clone(), Value::from(email));
        body.insert(self.password_field.clone(), Value::from(password));
        Value::Object(body)
    }

    /// Extract the bearer token from a login response
    pub fn parse_token(&self, body: &Value) -> Result<String, ParseError> {
        as_object(body, "login response")?
            .get(&self.token_field)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ParseError::MissingField(self.token_field.clone()))
    }

    /// `{device_id, command, ...parameters}`
    pub fn control_body(&self, request: &CommandRequest) -> Value {
        let mut body = Map::new();
        for (name, value) in request.parameters().iter() {
            body.insert(name.to_string(), serde_json::to_value(value).unwrap_or(Value::Null));
        }
        body.insert(self.device_id_field.clone(), Value::from(request.target_id()));
        body.insert(
            self.command_field.clone(),
            Value::from(request.opcode().name()),
        );
        Value::Object(body)
    }

    /// Explicit refusal in a control response, if any
    pub fn control_refusal(&self, body: &Value) -> Option<String> {
        let object = body.as_object()?;
        match object.get(&self.success_field) {
            Some(Value::Bool(false)) => Some(
                object
                    .get(&self.message_field)
                    .and_then(Value::as_str)
                    .unwrap_or("device refused the command")
                    .to_string(),
            ),
            _ => None,
        }
    }

    pub fn parse_listing(&self, body: &Value) -> Result<DeviceListing, ParseError> {
        let object = as_object(body, "device list")?;
        let entries = object
            .get(&self.devices_field)
            .ok_or_else(|| ParseError::MissingField(self.devices_field.clone()))?
            .as_array()
            .ok_or_else(|| ParseError::Json(format!("{} is not an array", self.devices_field)))?;

        let devices = entries
            .iter()
            .map(|entry| self.parse_summary(entry))
            .collect::<Result<Vec<_>, _>>()?;

        let removed = match object.get(&self.removed_field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(ids)) => ids
                .iter()
                .map(|v| id_string(v).ok_or_else(|| invalid("removed", v)))
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => return Err(invalid("removed", other)),
        };

        Ok(DeviceListing { devices, removed })
    }

    fn parse_summary(&self, entry: &Value) -> Result<DeviceSummary, ParseError> {
        let object = as_object(entry, "device entry")?;
        let id = object
            .get(&self.id_field)
            .and_then(id_string)
            .ok_or_else(|| ParseError::MissingField(self.id_field.clone()))?;
        let name = object
            .get(&self.name_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let device_type = match object.get(&self.type_field) {
            None | Some(Value::Null) => DeviceType::Controller,
            Some(v) => parse_device_type(v)?,
        };
        let features = match object.get(&self.features_field) {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(v) => parse_features(v)?,
        };

        Ok(DeviceSummary {
            id,
            name,
            device_type,
            features,
        })
    }

    /// Parse a status response; `raw` is the body as received
    pub fn parse_status(&self, body: &Value, raw: Vec<u8>) -> Result<DeviceStatus, ParseError> {
        let object = as_object(body, "status")?;
        let field = |name: &String| object.get(name).filter(|v| !v.is_null());

        let power_state = match field(&self.power_field) {
            None => PowerState::Unknown,
            Some(Value::Bool(true)) => PowerState::On,
            Some(Value::Bool(false)) => PowerState::Off,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("on") => PowerState::On,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("off") => PowerState::Off,
            Some(other) => return Err(invalid("power", other)),
        };

        let brightness = field(&self.brightness_field)
            .map(|v| parse_percent("brightness", v))
            .transpose()?;
        let battery_percent = field(&self.battery_field)
            .map(|v| parse_percent("battery", v))
            .transpose()?;
        let firmware_version = match field(&self.firmware_field) {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => return Err(invalid("firmware_version", other)),
        };
        let device_type = field(&self.type_field).map(parse_device_type).transpose()?;
        let features = field(&self.features_field).map(parse_features).transpose()?;
        let sensors = field(&self.sensors_field)
            .map(|v| self.parse_sensors(v))
            .transpose()?;

        Ok(DeviceStatus {
            power_state,
            brightness,
            device_type,
            features,
            firmware_version,
            battery_percent,
            sensors,
            raw,
        })
    }
}

impl CloudContract {
    fn parse_sensors(&self, value: &Value) -> Result<SensorSample, ParseError> {
        let object = as_object(value, "sensors")?;
        let keys = self.sensor_keys.in_wire_order();
        let mut readings = [None; 8];
        for ((slot, key), name) in readings.iter_mut().zip(keys).zip(READINGS) {
            match object.get(key) {
                None | Some(Value::Null) => {}
                Some(v) => {
                    let reading = v.as_f64().ok_or_else(|| invalid(name, v))?;
                    *slot = Some(reading as f32);
                }
            }
        }
        Ok(SensorSample::from_readings(readings))
    }
}

fn parse_percent(field: &'static str, value: &Value) -> Result<Percent, ParseError> {
    value
        .as_u64()
        .and_then(|v| u8::try_from(v).ok())
        .and_then(Percent::new)
        .ok_or_else(|| invalid(field, value))
}

fn parse_device_type(value: &Value) -> Result<DeviceType, ParseError> {
    value
        .as_str()
        .and_then(DeviceType::from_name)
        .ok_or_else(|| invalid("type", value))
}

fn parse_features(value: &Value) -> Result<BTreeSet<Feature>, ParseError> {
    let names = value.as_array().ok_or_else(|| invalid("features", value))?;
    let mut features = BTreeSet::new();
    for name in names {
        let name = name.as_str().ok_or_else(|| invalid("features", name))?;
        match Feature::from_name(name) {
            Some(feature) => {
                features.insert(feature);
            }
            None => debug!("Ignoring unknown feature tag {:?}", name),
        }
    }
    Ok(features)
}

/// Reading names in wire order, used for the default keys and in errors
const READINGS: [&str; 8] = [
    "temperature",
    "humidity",
    "co2",
    "vpd",
    "ppfd",
    "wind_speed",
    "wind_pressure",
    "air_volume",
];
