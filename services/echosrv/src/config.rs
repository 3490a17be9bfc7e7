//! Service configuration
//!
//! Loaded from YAML, JSON or TOML, with `ECHOSRV_` environment overrides
//! (`ECHOSRV_MQTT__BROKER=tcp://broker:1883`).
//!
//! The flat layout `{"broker": "...", "list": [...]}` is still accepted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use voltage_echonet::{DeviceConfig, TransportConfig};

use crate::error::{EchoSrvError, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ECHOSRV_";

/// Default MQTT port when the broker address omits it
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Topic level separator and MQTT wildcards; device names become topic levels
const RESERVED_NAME_CHARS: [char; 3] = ['/', '+', '#'];

// ============================================================================
// Sections
// ============================================================================

fn default_service_name() -> String {
    "echosrv".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Overrides the `--log-level` default when set
    #[serde(default)]
    pub log_level: Option<String>,
    /// Rolling log file directory; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: None,
            log_dir: None,
            log_json: false,
        }
    }
}

fn default_broker() -> String {
    format!("tcp://127.0.0.1:{}", DEFAULT_MQTT_PORT)
}

fn default_client_id() -> String {
    "echosrv".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// `tcp://host:port`, `mqtt://host:port` or `host[:port]`
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub qos: u8,
    /// Publish state with the retain flag
    #[serde(default = "default_true")]
    pub retain: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id: default_client_id(),
            username: None,
            password: None,
            qos: 0,
            retain: true,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    /// Broker host and port
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let raw = self.broker.trim();
        let url = if raw.contains("://") {
            Url::parse(raw)?
        } else {
            Url::parse(&format!("tcp://{}", raw))?
        };
        match url.scheme() {
            "tcp" | "mqtt" => {},
            other => {
                return Err(EchoSrvError::config(format!(
                    "unsupported broker scheme '{}'",
                    other
                )))
            },
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EchoSrvError::config(format!("broker '{}' has no host", raw)))?;
        Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MQTT_PORT)))
    }
}

fn default_poll_interval() -> u64 {
    300
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Full poll of every device
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Quiet period before touched devices are re-queried
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    /// Capacity of the device-event and inbound-message queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Multicast a node instance list request at startup
    #[serde(default)]
    pub announce_on_start: bool,
    /// Ask every device for its property maps at startup
    #[serde(default = "default_true")]
    pub introspect_on_start: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            flush_interval_ms: default_flush_interval(),
            queue_capacity: default_queue_capacity(),
            announce_on_start: false,
            introspect_on_start: true,
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EchoSrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default, alias = "list")]
    pub devices: Vec<DeviceConfig>,
    /// Flat-layout broker address; replaces `mqtt.broker` when present
    #[serde(default, skip_serializing)]
    pub broker: Option<String>,
}

impl EchoSrvConfig {
    /// Load, normalise and validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = common::load_config(path, ENV_PREFIX)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        if let Some(broker) = self.broker.take() {
            self.mqtt.broker = broker;
        }
    }

    /// Checks that do not need sockets; device key uniqueness is enforced
    /// when the registry is built
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.qos > 2 {
            return Err(EchoSrvError::config(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.mqtt.qos
            )));
        }
        self.mqtt.endpoint()?;
        if self.bridge.poll_interval_secs == 0 {
            return Err(EchoSrvError::config("bridge.poll_interval_secs must be > 0"));
        }
        if self.bridge.flush_interval_ms == 0 {
            return Err(EchoSrvError::config("bridge.flush_interval_ms must be > 0"));
        }
        if self.bridge.queue_capacity == 0 {
            return Err(EchoSrvError::config("bridge.queue_capacity must be > 0"));
        }
        if let Some(device) = self
            .devices
            .iter()
            .find(|d| d.name.is_empty() || d.name.contains(RESERVED_NAME_CHARS))
        {
            return Err(EchoSrvError::config(format!(
                "device name '{}' must be non-empty and contain none of '/', '+', '#'",
                device.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use voltage_echonet::{DeviceKind, ObjectCode};

    fn write_temp(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_sections() {
        let file = write_temp(
            ".yaml",
            r#"
mqtt:
  broker: "mqtt://broker.local:1884"
  retain: false
transport:
  listen_port: 3611
  multicast: false
bridge:
  poll_interval_secs: 60
devices:
  - type: aircon
    name: living
    addr: 192.168.1.20
    eoj: "013001"
  - type: light
    name: hall
    addr: 192.168.1.30
    eoj: "029001"
"#,
        );
        let config = EchoSrvConfig::load(file.path()).unwrap();
        assert_eq!(config.mqtt.endpoint().unwrap(), ("broker.local".to_string(), 1884));
        assert!(!config.mqtt.retain);
        assert_eq!(config.transport.listen_port, 3611);
        assert_eq!(config.transport.device_port, 3610);
        assert!(!config.transport.multicast);
        assert_eq!(config.bridge.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.bridge.flush_interval(), Duration::from_millis(1000));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].kind, DeviceKind::Aircon);
        assert_eq!(config.devices[1].eoj, ObjectCode::new(0x029001));
    }

    #[test]
    fn test_load_flat_json_layout() {
        let file = write_temp(
            ".json",
            r#"{
  "broker": "192.168.1.5:1883",
  "list": [
    {"type": "light", "name": "porch", "addr": "192.168.1.31", "eoj": "029001"}
  ]
}"#,
        );
        let config = EchoSrvConfig::load(file.path()).unwrap();
        assert_eq!(config.mqtt.broker, "192.168.1.5:1883");
        assert_eq!(config.mqtt.endpoint().unwrap(), ("192.168.1.5".to_string(), 1883));
        assert!(config.mqtt.retain);
        assert_eq!(config.devices[0].name, "porch");
        assert_eq!(config.bridge.poll_interval_secs, 300);
    }

    #[test]
    fn test_unknown_device_kind_rejected() {
        let file = write_temp(
            ".json",
            r#"{"list": [{"type": "fridge", "name": "k", "addr": "192.168.1.2", "eoj": "03b701"}]}"#,
        );
        let err = EchoSrvConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported device kind"), "{}", err);
    }

    #[test]
    fn test_bad_object_code_rejected() {
        let file = write_temp(
            ".json",
            r#"{"list": [{"type": "light", "name": "k", "addr": "192.168.1.2", "eoj": "nothex"}]}"#,
        );
        assert!(EchoSrvConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EchoSrvConfig::default();
        assert!(config.validate().is_ok());

        config.mqtt.qos = 3;
        assert!(config.validate().is_err());

        let mut config = EchoSrvConfig::default();
        config.mqtt.broker = "ws://broker:80".to_string();
        assert!(config.validate().is_err());

        let mut config = EchoSrvConfig::default();
        config.bridge.flush_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_topic_characters_in_names() {
        for name in ["living/room", "living+", "#", ""] {
            let mut config = EchoSrvConfig::default();
            config.devices.push(DeviceConfig::new(
                DeviceKind::Light,
                name,
                std::net::Ipv4Addr::new(192, 168, 1, 30),
                ObjectCode::new(0x029001),
            ));
            assert!(config.validate().is_err(), "{:?}", name);
        }

        let mut config = EchoSrvConfig::default();
        config.devices.push(DeviceConfig::new(
            DeviceKind::Light,
            "living_room-1",
            std::net::Ipv4Addr::new(192, 168, 1, 30),
            ObjectCode::new(0x029001),
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_default_port() {
        let config = MqttConfig {
            broker: "broker.local".to_string(),
            ..Default::default()
        };
        assert_eq!(config.endpoint().unwrap(), ("broker.local".to_string(), 1883));
    }
}
