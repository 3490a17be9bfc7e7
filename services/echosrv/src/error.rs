//! Error types for the bridge service

use common::ConfigLoadError;
use thiserror::Error;
use voltage_echonet::EchonetError;

#[derive(Error, Debug, Clone)]
pub enum EchoSrvError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Device(#[from] EchonetError),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl EchoSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn mqtt(msg: impl Into<String>) -> Self {
        Self::MqttError(msg.into())
    }
}

impl From<ConfigLoadError> for EchoSrvError {
    fn from(err: ConfigLoadError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<rumqttc::ClientError> for EchoSrvError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::MqttError(err.to_string())
    }
}

impl From<url::ParseError> for EchoSrvError {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigError(format!("invalid broker url: {}", err))
    }
}

impl From<std::io::Error> for EchoSrvError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EchoSrvError>;
