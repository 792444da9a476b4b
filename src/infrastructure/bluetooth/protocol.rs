//! Grow Controller Wire Protocol
//!
//! This module contains the protocol table (UUIDs and opcode bytes) and the codec
//! that turns commands into frames and frames into typed values. It does no I/O.
//!
//! The opcode bytes and UUIDs shipped in [`ProtocolTable::placeholder`] are not the
//! vendor's real values; they are the working guesses of the protocol capture effort
//! and are meant to be replaced through configuration.

use crate::domain::command::{CommandRequest, Opcode, ParamKind, ParamValue, Parameters};
use crate::domain::models::{DeviceType, Feature, Percent, PowerState, SensorSample};
use crate::error::{ParseError, SchemaError};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Version tag of the placeholder layout
pub const PLACEHOLDER_VERSION: &str = "marspro-ble/0-placeholder";

/// Byte of each opcode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcodeTable {
    pub get_device_info: u8,
    pub get_sensor_data: u8,
    pub power: u8,
    pub set_light: u8,
    pub set_temperature: u8,
    pub set_humidity: u8,
    pub set_co2: u8,
    pub set_fan: u8,
    pub set_drip: u8,
    pub set_heating_pad: u8,
    pub set_socket: u8,
    pub set_auto_mode: u8,
    pub set_timer: u8,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self {
            get_device_info: 0x01,
            get_sensor_data: 0x02,
            power: 0x03,
            set_light: 0x10,
            set_temperature: 0x20,
            set_humidity: 0x21,
            set_co2: 0x22,
            set_fan: 0x30,
            set_drip: 0x40,
            set_heating_pad: 0x50,
            set_socket: 0x60,
            set_auto_mode: 0x70,
            set_timer: 0x80,
        }
    }
}

impl OpcodeTable {
    pub fn byte(&self, opcode: Opcode) -> u8 {
        match opcode {
            Opcode::GetDeviceInfo => self.get_device_info,
            Opcode::GetSensorData => self.get_sensor_data,
            Opcode::Power => self.power,
            Opcode::SetLight => self.set_light,
            Opcode::SetTemperature => self.set_temperature,
            Opcode::SetHumidity => self.set_humidity,
            Opcode::SetCo2 => self.set_co2,
            Opcode::SetFan => self.set_fan,
            Opcode::SetDrip => self.set_drip,
            Opcode::SetHeatingPad => self.set_heating_pad,
            Opcode::SetSocket => self.set_socket,
            Opcode::SetAutoMode => self.set_auto_mode,
            Opcode::SetTimer => self.set_timer,
        }
    }

    pub fn opcode(&self, byte: u8) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| self.byte(*op) == byte)
    }
}

/// Versioned UUIDs and opcode bytes for one protocol revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTable {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_command_uuid")]
    pub command_char_uuid: Uuid,
    #[serde(default = "default_data_uuid")]
    pub data_char_uuid: Uuid,
    #[serde(default = "default_configuration_uuid")]
    pub configuration_char_uuid: Uuid,
    #[serde(default = "default_status_uuid")]
    pub status_char_uuid: Uuid,
    #[serde(default)]
    pub opcodes: OpcodeTable,
}

fn default_version() -> String {
    PLACEHOLDER_VERSION.to_string()
}
fn default_service_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb)
}
fn default_command_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb)
}
fn default_data_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb)
}
fn default_configuration_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe3_0000_1000_8000_00805f9b34fb)
}
fn default_status_uuid() -> Uuid {
    Uuid::from_u128(0x0000ffe4_0000_1000_8000_00805f9b34fb)
}

impl Default for ProtocolTable {
    fn default() -> Self {
        Self::placeholder()
    }
}

impl ProtocolTable {
    /// Table used until the real protocol is known
    pub fn placeholder() -> Self {
        Self {
            version: default_version(),
            service_uuid: default_service_uuid(),
            command_char_uuid: default_command_uuid(),
            data_char_uuid: default_data_uuid(),
            configuration_char_uuid: default_configuration_uuid(),
            status_char_uuid: default_status_uuid(),
            opcodes: OpcodeTable::default(),
        }
    }

    /// Reject tables that could not be decoded unambiguously
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            anyhow::bail!("Protocol table needs a version tag");
        }

        let mut seen = HashSet::new();
        for op in Opcode::ALL {
            let byte = self.opcodes.byte(op);
            if !seen.insert(byte) {
                anyhow::bail!("Opcode byte {:#04x} assigned twice (at {})", byte, op);
            }
        }

        let chars = [
            self.command_char_uuid,
            self.data_char_uuid,
            self.configuration_char_uuid,
            self.status_char_uuid,
        ];
        let unique: HashSet<_> = chars.iter().collect();
        if unique.len() != chars.len() {
            anyhow::bail!("Characteristic UUIDs must be distinct");
        }
        Ok(())
    }
}

/// Which layout to apply when decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Command,
    Status,
    Sensors,
}

/// Decoded device-info frame
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFrame {
    pub power_state: PowerState,
    pub brightness: Percent,
    pub device_type: DeviceType,
    pub features: BTreeSet<Feature>,
    pub firmware_version: Option<(u8, u8, u8)>,
    pub battery_percent: Option<Percent>,
}

/// Any decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Command(Opcode, Parameters),
    Status(StatusFrame),
    Sensors(SensorSample),
}

const STATUS_HEADER: usize = 6;
const SENSOR_HEADER: usize = 2;
const FLAG_FIRMWARE: u8 = 0x01;
const FLAG_BATTERY: u8 = 0x02;

/// Encoder/decoder bound to one protocol table
///
/// # Command frame
///
/// ```text
/// [0]     : opcode byte
/// [1..]   : parameters in schema order
///           bool = 1 byte (0/1), u8 = 1 byte,
///           u16 = 2 bytes little-endian, f32 = 4 bytes little-endian
/// ```
///
/// # Status frame (status characteristic)
///
/// ```text
/// [0]     : get_device_info opcode
/// [1]     : flags   bit 0: firmware present, bit 1: battery present
/// [2]     : power   0 = off, 1 = on, 2 = unknown
/// [3]     : brightness 0-100
/// [4]     : device type 0 = controller, 1 = sensor, 2 = actuator
/// [5]     : features bit 0: lighting, 1: climate, 2: water, 3: air, 4: heating
/// [6-8]   : firmware major.minor.patch (if flagged)
/// [next]  : battery 0-100 (if flagged)
/// ```
///
/// # Sensor frame (data characteristic, read or notify)
///
/// ```text
/// [0]     : get_sensor_data opcode
/// [1]     : presence mask, bit n set = reading n follows
/// [2..]   : one f32 little-endian per set bit, in order
///           temperature, humidity, co2, vpd, ppfd,
///           wind speed, wind pressure, air volume
/// ```
#[derive(Debug, Clone)]
pub struct Codec {
    table: Arc<ProtocolTable>,
}

impl Codec {
    pub fn new(table: Arc<ProtocolTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ProtocolTable {
        &self.table
    }

    /// Validate and encode
    pub fn encode(&self, opcode: Opcode, parameters: &Parameters) -> Result<Vec<u8>, SchemaError> {
        let parameters = opcode.validate(parameters)?;
        Ok(self.encode_validated(opcode, &parameters))
    }

    /// Encode an already validated request
    pub fn encode_request(&self, request: &CommandRequest) -> Vec<u8> {
        self.encode_validated(request.opcode(), request.parameters())
    }

    fn encode_validated(&self, opcode: Opcode, parameters: &Parameters) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + opcode.body_width());
        frame.push(self.table.opcodes.byte(opcode));

        for spec in opcode.schema() {
            match (spec.kind, parameters.get(spec.name)) {
                (ParamKind::Bool, Some(ParamValue::Bool(b))) => frame.push(u8::from(b)),
                (ParamKind::U8 { .. }, Some(ParamValue::Int(v))) => frame.push(v as u8),
                (ParamKind::U16 { .. }, Some(ParamValue::Int(v))) => {
                    frame.extend_from_slice(&(v as u16).to_le_bytes())
                }
                (ParamKind::F32 { .. }, Some(ParamValue::Float(v))) => {
                    frame.extend_from_slice(&v.to_le_bytes())
                }
                // validate() normalizes every field to the variant matching its kind
                _ => frame.extend(std::iter::repeat(0).take(spec.kind.width())),
            }
        }

        trace!("Encoded {}: {:02X?}", opcode, frame);
        frame
    }

    /// Decode a frame with the layout for `kind`
    pub fn decode(&self, kind: FrameKind, bytes: &[u8]) -> Result<Frame, ParseError> {
        match kind {
            FrameKind::Command => self
                .decode_command(bytes)
                .map(|(op, params)| Frame::Command(op, params)),
            FrameKind::Status => self.decode_status(bytes).map(Frame::Status),
            FrameKind::Sensors => self.decode_sensors(bytes).map(Frame::Sensors),
        }
    }

    pub fn decode_command(&self, bytes: &[u8]) -> Result<(Opcode, Parameters), ParseError> {
        let (&first, body) = bytes.split_first().ok_or(ParseError::Empty)?;
        let opcode = self
            .table
            .opcodes
            .opcode(first)
            .ok_or(ParseError::UnknownOpcode(first))?;
        check_length("command", bytes.len(), 1 + opcode.body_width(), true)?;

        let mut params = Parameters::new();
        let mut offset = 0;
        for spec in opcode.schema() {
            let field = &body[offset..offset + spec.kind.width()];
            offset += spec.kind.width();
            let value = match spec.kind {
                ParamKind::Bool => ParamValue::Bool(decode_bool(spec.name, field[0])?),
                ParamKind::U8 { min, max } => {
                    let v = field[0];
                    if v < min || v > max {
                        return Err(invalid(spec.name, v));
                    }
                    ParamValue::Int(v.into())
                }
                ParamKind::U16 { min, max } => {
                    let v = u16::from_le_bytes([field[0], field[1]]);
                    if v < min || v > max {
                        return Err(invalid(spec.name, v));
                    }
                    ParamValue::Int(v.into())
                }
                ParamKind::F32 { min, max } => {
                    let v = f32::from_le_bytes([field[0], field[1], field[2], field[3]]);
                    if !v.is_finite() || v < min || v > max {
                        return Err(invalid(spec.name, v));
                    }
                    ParamValue::Float(v)
                }
            };
            params.insert(spec.name, value);
        }
        Ok((opcode, params))
    }

    pub fn decode_status(&self, bytes: &[u8]) -> Result<StatusFrame, ParseError> {
        check_length("status", bytes.len(), STATUS_HEADER, false)?;
        self.expect_opcode(Opcode::GetDeviceInfo, bytes[0])?;

        let flags = bytes[1];
        if flags & !(FLAG_FIRMWARE | FLAG_BATTERY) != 0 {
            return Err(invalid("flags", flags));
        }
        let has_firmware = flags & FLAG_FIRMWARE != 0;
        let has_battery = flags & FLAG_BATTERY != 0;
        let expected =
            STATUS_HEADER + if has_firmware { 3 } else { 0 } + usize::from(has_battery);
        check_length("status", bytes.len(), expected, true)?;

        let power_state = match bytes[2] {
            0 => PowerState::Off,
            1 => PowerState::On,
            2 => PowerState::Unknown,
            other => return Err(invalid("power", other)),
        };
        let brightness = Percent::new(bytes[3]).ok_or_else(|| invalid("brightness", bytes[3]))?;
        let device_type = match bytes[4] {
            0 => DeviceType::Controller,
            1 => DeviceType::Sensor,
            2 => DeviceType::Actuator,
            other => return Err(invalid("device_type", other)),
        };
        let features = decode_features(bytes[5])?;

        let mut offset = STATUS_HEADER;
        let firmware_version = if has_firmware {
            let v = (bytes[offset], bytes[offset + 1], bytes[offset + 2]);
            offset += 3;
            Some(v)
        } else {
            None
        };
        let battery_percent = if has_battery {
            Some(Percent::new(bytes[offset]).ok_or_else(|| invalid("battery", bytes[offset]))?)
        } else {
            None
        };

        Ok(StatusFrame {
            power_state,
            brightness,
            device_type,
            features,
            firmware_version,
            battery_percent,
        })
    }

    pub fn decode_sensors(&self, bytes: &[u8]) -> Result<SensorSample, ParseError> {
        check_length("sensor", bytes.len(), SENSOR_HEADER, false)?;
        self.expect_opcode(Opcode::GetSensorData, bytes[0])?;

        let mask = bytes[1];
        let expected = SENSOR_HEADER + 4 * mask.count_ones() as usize;
        check_length("sensor", bytes.len(), expected, true)?;

        let mut readings = [None; 8];
        let mut offset = SENSOR_HEADER;
        for (bit, slot) in readings.iter_mut().enumerate() {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let v = f32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]);
            if !v.is_finite() {
                return Err(invalid(SENSOR_FIELDS[bit], v));
            }
            *slot = Some(v);
            offset += 4;
        }
        Ok(SensorSample::from_readings(readings))
    }

    /// Inverse of [`Codec::decode_status`]; used by device simulators and tests
    pub fn encode_status(&self, status: &StatusFrame) -> Vec<u8> {
        let mut flags = 0;
        if status.firmware_version.is_some() {
            flags |= FLAG_FIRMWARE;
        }
        if status.battery_percent.is_some() {
            flags |= FLAG_BATTERY;
        }
        let mut frame = vec![
            self.table.opcodes.byte(Opcode::GetDeviceInfo),
            flags,
            match status.power_state {
                PowerState::Off => 0,
                PowerState::On => 1,
                PowerState::Unknown => 2,
            },
            status.brightness.get(),
            match status.device_type {
                DeviceType::Controller => 0,
                DeviceType::Sensor => 1,
                DeviceType::Actuator => 2,
            },
            encode_features(&status.features),
        ];
        if let Some((major, minor, patch)) = status.firmware_version {
            frame.extend_from_slice(&[major, minor, patch]);
        }
        if let Some(battery) = status.battery_percent {
            frame.push(battery.get());
        }
        frame
    }

    /// Inverse of [`Codec::decode_sensors`]
    pub fn encode_sensors(&self, sample: &SensorSample) -> Vec<u8> {
        let mut frame = vec![self.table.opcodes.byte(Opcode::GetSensorData), 0];
        for (bit, reading) in sample.readings().into_iter().enumerate() {
            if let Some(v) = reading {
                frame[1] |= 1 << bit;
                frame.extend_from_slice(&v.to_le_bytes());
            }
        }
        frame
    }

    fn expect_opcode(&self, opcode: Opcode, actual: u8) -> Result<(), ParseError> {
        let expected = self.table.opcodes.byte(opcode);
        if actual != expected {
            return Err(ParseError::UnexpectedOpcode { expected, actual });
        }
        Ok(())
    }
}

const SENSOR_FIELDS: [&str; 8] = [
    "temperature",
    "humidity",
    "co2",
    "vpd",
    "ppfd",
    "wind_speed",
    "wind_pressure",
    "air_volume",
];

fn check_length(
    what: &'static str,
    actual: usize,
    expected: usize,
    exact: bool,
) -> Result<(), ParseError> {
    if actual < expected {
        return Err(ParseError::Truncated {
            what,
            expected,
            actual,
        });
    }
    if exact && actual > expected {
        return Err(ParseError::TrailingBytes {
            what,
            extra: actual - expected,
        });
    }
    Ok(())
}

fn invalid(field: &'static str, value: impl std::fmt::Display) -> ParseError {
    ParseError::InvalidField {
        field,
        value: value.to_string(),
    }
}

fn decode_bool(field: &'static str, byte: u8) -> Result<bool, ParseError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(invalid(field, other)),
    }
}

fn decode_features(mask: u8) -> Result<BTreeSet<Feature>, ParseError> {
    if mask >> Feature::ALL.len() != 0 {
        return Err(invalid("features", format!("{mask:#04x}")));
    }
    Ok(Feature::ALL
        .into_iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, f)| f)
        .collect())
}

fn encode_features(features: &BTreeSet<Feature>) -> u8 {
    Feature::ALL
        .into_iter()
        .enumerate()
        .filter(|(_, f)| features.contains(f))
        .fold(0, |mask, (bit, _)| mask | (1 << bit))
}
