//! Error types
//!
//! Every component reports failures through [`ControlError`]. The codec has two
//! narrower types of its own: [`ParseError`] for frames coming off the wire and
//! [`SchemaError`] for parameters that fail validation before anything is encoded.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the control layer
pub type Result<T> = std::result::Result<T, ControlError>;

/// Shared error taxonomy for both transports and the coordinator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// Transport unreachable or the link dropped
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials rejected (one re-authentication already attempted)
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Per-operation bound exceeded
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Peer answered, but not in the expected shape
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Malformed payload
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Operation-specific failure (invalid parameters, unsupported opcode, device refused)
    #[error("command rejected: {0}")]
    Command(String),

    /// A whole poll cycle could not establish a device list
    #[error("update failed: {0}")]
    UpdateFailed(String),
}

impl ControlError {
    /// Prefix the error message with context, keeping the variant
    ///
    /// `Timeout` and `Parse` are structured and pass through unchanged: a timeout
    /// already names its operation, and a parse error names the frame and field.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::Connection(msg) => Self::Connection(format!("{context}: {msg}")),
            Self::Authentication(msg) => Self::Authentication(format!("{context}: {msg}")),
            Self::ProtocolMismatch(msg) => Self::ProtocolMismatch(format!("{context}: {msg}")),
            Self::Command(msg) => Self::Command(format!("{context}: {msg}")),
            Self::UpdateFailed(msg) => Self::UpdateFailed(format!("{context}: {msg}")),
            other => other,
        }
    }
}

impl From<SchemaError> for ControlError {
    fn from(err: SchemaError) -> Self {
        Self::Command(err.to_string())
    }
}

/// A wire frame that could not be decoded
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("frame is empty")]
    Empty,

    #[error("{what} frame too short: {actual} bytes, need at least {expected}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what} frame has {extra} trailing bytes")]
    TrailingBytes { what: &'static str, extra: usize },

    #[error("unknown opcode byte {0:#04x}")]
    UnknownOpcode(u8),

    #[error("expected opcode {expected:#04x}, got {actual:#04x}")]
    UnexpectedOpcode { expected: u8, actual: u8 },

    #[error("field `{field}` has invalid value {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("payload field `{0}` missing")]
    MissingField(String),

    #[error("payload is not valid JSON: {0}")]
    Json(String),
}

/// Parameters rejected before encoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("unknown command `{0}`")]
    UnknownOpcode(String),

    #[error("`{opcode}` is a read opcode and cannot be sent as a command")]
    NotACommand { opcode: &'static str },

    #[error("`{opcode}` requires parameter `{param}`")]
    MissingParameter {
        opcode: &'static str,
        param: &'static str,
    },

    #[error("`{opcode}` does not take parameter `{param}`")]
    UnexpectedParameter { opcode: &'static str, param: String },

    #[error("`{opcode}.{param}` expects {expected}")]
    WrongType {
        opcode: &'static str,
        param: &'static str,
        expected: &'static str,
    },

    #[error("`{opcode}.{param}` = {value} is outside {min}..={max}")]
    OutOfRange {
        opcode: &'static str,
        param: &'static str,
        value: String,
        min: String,
        max: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_variant() {
        let err = ControlError::Connection("link dropped".into()).context("read status");
        assert_eq!(
            err,
            ControlError::Connection("read status: link dropped".into())
        );
    }

    #[test]
    fn test_context_leaves_structured_errors() {
        let timeout = ControlError::Timeout {
            operation: "read status",
            after: Duration::from_secs(10),
        };
        assert_eq!(timeout.clone().context("ble"), timeout);

        let parse = ControlError::Parse(ParseError::Empty);
        assert_eq!(parse.clone().context("cloud"), parse);
    }

    #[test]
    fn test_schema_error_maps_to_command() {
        let err: ControlError = SchemaError::UnknownOpcode("dance".into()).into();
        assert!(matches!(err, ControlError::Command(msg) if msg.contains("dance")));
    }
}
