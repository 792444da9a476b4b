//! Command model
//!
//! Every opcode carries a fixed parameter schema. A [`CommandRequest`] can only be
//! built from parameters that pass that schema, so the codec never sees a missing,
//! extra or out-of-range field.

use crate::domain::models::Feature;
use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Command and read kinds understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    GetDeviceInfo,
    GetSensorData,
    Power,
    SetLight,
    SetTemperature,
    SetHumidity,
    SetCo2,
    SetFan,
    SetDrip,
    SetHeatingPad,
    SetSocket,
    SetAutoMode,
    SetTimer,
}

/// Wire width and accepted range of one parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    Bool,
    U8 { min: u8, max: u8 },
    U16 { min: u16, max: u16 },
    F32 { min: f32, max: f32 },
}

impl ParamKind {
    /// Encoded size in bytes
    pub fn width(&self) -> usize {
        match self {
            Self::Bool | Self::U8 { .. } => 1,
            Self::U16 { .. } => 2,
            Self::F32 { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

const PERCENT: ParamKind = ParamKind::U8 { min: 0, max: 100 };
const CHANNEL: ParamKind = ParamKind::U8 { min: 0, max: 7 };
const MINUTE_OF_DAY: ParamKind = ParamKind::U16 { min: 0, max: 1439 };

const fn param(name: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec { name, kind }
}

const POWER: &[ParamSpec] = &[param("on", ParamKind::Bool)];
const SET_LIGHT: &[ParamSpec] = &[param("intensity", PERCENT)];
const SET_TEMPERATURE: &[ParamSpec] = &[param(
    "temperature",
    ParamKind::F32 {
        min: -20.0,
        max: 60.0,
    },
)];
const SET_HUMIDITY: &[ParamSpec] = &[param(
    "humidity",
    ParamKind::F32 {
        min: 0.0,
        max: 100.0,
    },
)];
const SET_CO2: &[ParamSpec] = &[param("co2", ParamKind::U16 { min: 0, max: 5000 })];
const SET_FAN: &[ParamSpec] = &[param("speed", PERCENT)];
const SET_DRIP: &[ParamSpec] = &[param("rate", PERCENT)];
const SET_HEATING_PAD: &[ParamSpec] =
    &[param("enabled", ParamKind::Bool), param("level", PERCENT)];
const SET_SOCKET: &[ParamSpec] = &[param("channel", CHANNEL), param("on", ParamKind::Bool)];
const SET_AUTO_MODE: &[ParamSpec] = &[param("enabled", ParamKind::Bool)];
const SET_TIMER: &[ParamSpec] = &[
    param("channel", CHANNEL),
    param("on_minute", MINUTE_OF_DAY),
    param("off_minute", MINUTE_OF_DAY),
];

impl Opcode {
    pub const ALL: [Opcode; 13] = [
        Opcode::GetDeviceInfo,
        Opcode::GetSensorData,
        Opcode::Power,
        Opcode::SetLight,
        Opcode::SetTemperature,
        Opcode::SetHumidity,
        Opcode::SetCo2,
        Opcode::SetFan,
        Opcode::SetDrip,
        Opcode::SetHeatingPad,
        Opcode::SetSocket,
        Opcode::SetAutoMode,
        Opcode::SetTimer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetDeviceInfo => "get_device_info",
            Self::GetSensorData => "get_sensor_data",
            Self::Power => "power",
            Self::SetLight => "set_light",
            Self::SetTemperature => "set_temperature",
            Self::SetHumidity => "set_humidity",
            Self::SetCo2 => "set_co2",
            Self::SetFan => "set_fan",
            Self::SetDrip => "set_drip",
            Self::SetHeatingPad => "set_heating_pad",
            Self::SetSocket => "set_socket",
            Self::SetAutoMode => "set_auto_mode",
            Self::SetTimer => "set_timer",
        }
    }

    /// Read opcodes query the device and are never sent as commands
    pub fn is_read(&self) -> bool {
        matches!(self, Self::GetDeviceInfo | Self::GetSensorData)
    }

    /// Parameters in wire order
    pub fn schema(&self) -> &'static [ParamSpec] {
        match self {
            Self::GetDeviceInfo | Self::GetSensorData => &[],
            Self::Power => POWER,
            Self::SetLight => SET_LIGHT,
            Self::SetTemperature => SET_TEMPERATURE,
            Self::SetHumidity => SET_HUMIDITY,
            Self::SetCo2 => SET_CO2,
            Self::SetFan => SET_FAN,
            Self::SetDrip => SET_DRIP,
            Self::SetHeatingPad => SET_HEATING_PAD,
            Self::SetSocket => SET_SOCKET,
            Self::SetAutoMode => SET_AUTO_MODE,
            Self::SetTimer => SET_TIMER,
        }
    }

    /// Encoded body size (without the opcode byte)
    pub fn body_width(&self) -> usize {
        self.schema().iter().map(|p| p.kind.width()).sum()
    }

    /// Feature a device must advertise to accept this opcode
    pub fn required_feature(&self) -> Option<Feature> {
        match self {
            Self::SetLight => Some(Feature::Lighting),
            Self::SetTemperature | Self::SetHumidity | Self::SetCo2 => Some(Feature::Climate),
            Self::SetFan => Some(Feature::Air),
            Self::SetDrip => Some(Feature::Water),
            Self::SetHeatingPad => Some(Feature::Heating),
            _ => None,
        }
    }

    /// Check `params` against the schema and return them normalized
    pub fn validate(&self, params: &Parameters) -> Result<Parameters, SchemaError> {
        let opcode = self.name();
        let schema = self.schema();

        if let Some(unexpected) = params
            .0
            .keys()
            .find(|k| !schema.iter().any(|p| p.name == k.as_str()))
        {
            return Err(SchemaError::UnexpectedParameter {
                opcode,
                param: unexpected.clone(),
            });
        }

        let mut normalized = Parameters::default();
        for spec in schema {
            let value = params.get(spec.name).ok_or(SchemaError::MissingParameter {
                opcode,
                param: spec.name,
            })?;
            normalized.insert(spec.name, check_value(opcode, spec, value)?);
        }
        Ok(normalized)
    }
}

fn check_value(
    opcode: &'static str,
    spec: &ParamSpec,
    value: ParamValue,
) -> Result<ParamValue, SchemaError> {
    let wrong_type = |expected| SchemaError::WrongType {
        opcode,
        param: spec.name,
        expected,
    };
    let out_of_range = |value: String, min: String, max: String| SchemaError::OutOfRange {
        opcode,
        param: spec.name,
        value,
        min,
        max,
    };

    match (spec.kind, value) {
        (ParamKind::Bool, ParamValue::Bool(b)) => Ok(ParamValue::Bool(b)),
        (ParamKind::Bool, _) => Err(wrong_type("a boolean")),
        (ParamKind::U8 { min, max }, ParamValue::Int(v)) => {
            if v < i64::from(min) || v > i64::from(max) {
                Err(out_of_range(v.to_string(), min.to_string(), max.to_string()))
            } else {
                Ok(ParamValue::Int(v))
            }
        }
        (ParamKind::U16 { min, max }, ParamValue::Int(v)) => {
            if v < i64::from(min) || v > i64::from(max) {
                Err(out_of_range(v.to_string(), min.to_string(), max.to_string()))
            } else {
                Ok(ParamValue::Int(v))
            }
        }
        (ParamKind::U8 { .. } | ParamKind::U16 { .. }, _) => Err(wrong_type("an integer")),
        (ParamKind::F32 { min, max }, ParamValue::Float(v)) => {
            check_float(v, min, max).ok_or_else(|| {
                out_of_range(v.to_string(), min.to_string(), max.to_string())
            })
        }
        (ParamKind::F32 { min, max }, ParamValue::Int(i)) => {
            check_float(i as f32, min, max).ok_or_else(|| {
                out_of_range(i.to_string(), min.to_string(), max.to_string())
            })
        }
        (ParamKind::F32 { .. }, ParamValue::Bool(_)) => Err(wrong_type("a number")),
    }
}

fn check_float(v: f32, min: f32, max: f32) -> Option<ParamValue> {
    (v.is_finite() && v >= min && v <= max).then_some(ParamValue::Float(v))
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Opcode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SchemaError::UnknownOpcode(s.to_string()))
    }
}

/// A single named parameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f32),
}

impl ParamValue {
    /// Parse a CLI-style literal: `true`/`false`, an integer, or a decimal
    pub fn parse_literal(s: &str) -> Option<Self> {
        match s {
            "true" | "on" => Some(Self::Bool(true)),
            "false" | "off" => Some(Self::Bool(false)),
            _ => s
                .parse::<i64>()
                .map(Self::Int)
                .or_else(|_| s.parse::<f32>().map(Self::Float))
                .ok(),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u8> for ParamValue {
    fn from(v: u8) -> Self {
        Self::Int(v.into())
    }
}

impl From<u16> for ParamValue {
    fn from(v: u16) -> Self {
        Self::Int(v.into())
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

/// Named parameters for one command
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, ParamValue>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: ParamValue) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.0.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A validated command addressed to one device
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    opcode: Opcode,
    target_id: String,
    parameters: Parameters,
}

impl CommandRequest {
    /// Validate `parameters` against the opcode schema
    pub fn new(
        target_id: impl Into<String>,
        opcode: Opcode,
        parameters: Parameters,
    ) -> Result<Self, SchemaError> {
        if opcode.is_read() {
            return Err(SchemaError::NotACommand {
                opcode: opcode.name(),
            });
        }
        let parameters = opcode.validate(&parameters)?;
        Ok(Self {
            opcode,
            target_id: target_id.into(),
            parameters,
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// A command as the host names it, including the `power_on`/`power_off` shorthands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedCommand {
    pub opcode: Opcode,
    preset_power: Option<bool>,
}

impl NamedCommand {
    /// Merge the shorthand's implied parameters into `params`
    pub fn parameters(&self, mut params: Parameters) -> Parameters {
        if let Some(on) = self.preset_power {
            params.insert("on", ParamValue::Bool(on));
        }
        params
    }
}

impl FromStr for NamedCommand {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let preset_power = match s.to_ascii_lowercase().as_str() {
            "power_on" | "turn_on" => Some(true),
            "power_off" | "turn_off" => Some(false),
            _ => None,
        };
        let opcode = match preset_power {
            Some(_) => Opcode::Power,
            None => s.parse()?,
        };
        Ok(Self {
            opcode,
            preset_power,
        })
    }
}
