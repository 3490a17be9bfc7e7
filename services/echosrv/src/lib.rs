//! ECHONET Lite to MQTT bridge
//!
//! Devices listed in the configuration are polled over UDP and their state
//! is published under `<kind>/<name>/...`; commands arrive on
//! `<kind>/<name>/<attribute>/set`.

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod topic;

pub use bridge::{Bridge, PendingQueries};
pub use config::EchoSrvConfig;
pub use error::{EchoSrvError, Result};
pub use mqtt::{inbound_channel, InboundMessage, MessageBus, MqttBus};
