//! Device registry
//!
//! Ordered, read-only after construction. Both lookup keys must be unique:
//! `(kind, name)` for topic commands and `(address, object code)` for
//! inbound frames.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tracing::info;

use crate::device::{DeviceConfig, DeviceKind, DeviceObject, EventSender};
use crate::error::{EchonetError, Result};
use crate::frame::ObjectCode;

#[derive(Debug, Default)]
pub struct Registry {
    devices: Vec<Arc<DeviceObject>>,
    by_name: HashMap<(DeviceKind, String), usize>,
    by_source: HashMap<(Ipv4Addr, ObjectCode), usize>,
}

impl Registry {
    /// Build one `DeviceObject` per config, all sharing `events`
    pub fn from_configs(configs: &[DeviceConfig], events: &EventSender) -> Result<Self> {
        let mut registry = Self::default();
        for config in configs {
            registry.insert(Arc::new(DeviceObject::new(config.clone(), events.clone())))?;
        }
        info!("Registry: {} device(s)", registry.len());
        Ok(registry)
    }

    /// Add a device, rejecting either key collision
    pub fn insert(&mut self, device: Arc<DeviceObject>) -> Result<()> {
        let name_key = (device.kind(), device.name().to_string());
        if self.by_name.contains_key(&name_key) {
            return Err(EchonetError::DuplicateDevice(device.label()));
        }
        let source_key = (device.addr(), device.eoj());
        if let Some(&existing) = self.by_source.get(&source_key) {
            return Err(EchonetError::DuplicateDevice(format!(
                "{} and {} share {} {}",
                self.devices[existing].label(),
                device.label(),
                source_key.0,
                source_key.1
            )));
        }

        let index = self.devices.len();
        self.by_name.insert(name_key, index);
        self.by_source.insert(source_key, index);
        self.devices.push(device);
        Ok(())
    }

    pub fn get(&self, kind: DeviceKind, name: &str) -> Option<&Arc<DeviceObject>> {
        self.by_name
            .get(&(kind, name.to_string()))
            .map(|&i| &self.devices[i])
    }

    /// Like [`Registry::get`], as an `UnknownDevice` error
    pub fn resolve(&self, kind: DeviceKind, name: &str) -> Result<&Arc<DeviceObject>> {
        self.get(kind, name)
            .ok_or_else(|| EchonetError::unknown_device(format!("{}/{}", kind, name)))
    }

    /// Match an inbound frame's source address and SEOJ
    pub fn find_by_source(&self, addr: IpAddr, seoj: ObjectCode) -> Option<&Arc<DeviceObject>> {
        let IpAddr::V4(v4) = addr else {
            return None;
        };
        self.by_source.get(&(v4, seoj)).map(|&i| &self.devices[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceObject>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
