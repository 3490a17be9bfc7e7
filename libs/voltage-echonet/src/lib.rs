//! ECHONET Lite engine for the MQTT bridge
//!
//! - [`frame`]: wire codec
//! - [`propmap`]: property map decoding
//! - [`device`]: per-device state, command builders, response handling
//! - [`registry`]: device lookup by name and by source
//! - [`transport`]: paced UDP send path and receive tasks
//! - [`netif`]: multicast interface discovery

pub mod constants;
pub mod device;
pub mod error;
pub mod frame;
pub mod netif;
pub mod propmap;
pub mod registry;
pub mod transport;

pub use device::{
    event_channel, parse_power, DeviceConfig, DeviceEvent, DeviceKind, DeviceObject,
    DeviceSnapshot, DeviceState, EventReceiver, EventSender, FanLevel, Mode, PowerOffModePolicy,
    ResponseOutcome, Swing, POWER_OFF_MODE_POLICY,
};
pub use error::{EchonetError, Result};
pub use frame::{Frame, ObjectCode, Property, ServiceCode};
pub use propmap::{decode_property_map, PropertyMap};
pub use registry::Registry;
pub use transport::{FrameSender, Transport, TransportConfig};
