//! Error types for the ECHONET Lite engine

use thiserror::Error;

/// Engine error
///
/// Per-frame and per-command variants are local: callers log or report them
/// and keep going. Only `TransportFailure` raised while opening listeners at
/// startup is meant to be fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EchonetError {
    /// Decode failure: short buffer, bad magic or truncated property list
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// No registered device matches a lookup key
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Command value not recognised
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Numeric command value outside its accepted bounds
    #[error("Value {value} out of range [{min}, {max}]")]
    OutOfRange { value: i64, min: i64, max: i64 },

    #[error("Unsupported device kind: {0}")]
    UnsupportedDeviceKind(String),

    /// Device answered with an SNA service code
    #[error("Device denied request: {0}")]
    DeviceDenied(String),

    /// Socket bind, connect or write failure
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Registry key collision
    #[error("Duplicate device: {0}")]
    DuplicateDevice(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl EchonetError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unknown_device(msg: impl Into<String>) -> Self {
        Self::UnknownDevice(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn out_of_range(value: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange { value, min, max }
    }

    /// Whether the error concerns one frame or command only
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::TransportFailure(_) | Self::ConfigError(_))
    }
}

impl From<std::io::Error> for EchonetError {
    fn from(err: std::io::Error) -> Self {
        Self::TransportFailure(err.to_string())
    }
}

/// Result type for the engine
pub type Result<T> = std::result::Result<T, EchonetError>;
