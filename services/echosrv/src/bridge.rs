//! Control loop between the device registry and the message bus
//!
//! One task owns the loop. It reacts to device events, inbound commands,
//! the periodic poll and the debounced re-query of devices that were just
//! commanded.

use std::sync::Arc;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voltage_echonet::{
    DeviceEvent, DeviceObject, EchonetError, EventReceiver, FrameSender, Registry,
};

use crate::config::BridgeConfig;
use crate::mqtt::{InboundMessage, InboundReceiver, MessageBus};
use crate::topic::{self, TopicCommand};

/// Devices awaiting a state query after a command
#[derive(Debug, Default)]
pub struct PendingQueries {
    devices: Vec<Arc<DeviceObject>>,
    deadline: Option<Instant>,
}

impl PendingQueries {
    /// Add a device (once) and push the deadline out to `now + window`
    pub fn touch(&mut self, device: &Arc<DeviceObject>, now: Instant, window: std::time::Duration) {
        if !self.devices.iter().any(|d| Arc::ptr_eq(d, device)) {
            self.devices.push(Arc::clone(device));
        }
        self.deadline = Some(now + window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drain in first-touch order
    pub fn take(&mut self) -> Vec<Arc<DeviceObject>> {
        self.deadline = None;
        std::mem::take(&mut self.devices)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

pub struct Bridge {
    registry: Arc<Registry>,
    sender: Arc<dyn FrameSender>,
    bus: Arc<dyn MessageBus>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        registry: Arc<Registry>,
        sender: Arc<dyn FrameSender>,
        bus: Arc<dyn MessageBus>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            registry,
            sender,
            bus,
            config,
        }
    }

    /// Subscribe to every command topic of every device
    pub async fn subscribe_all(&self) -> crate::error::Result<()> {
        for device in self.registry.iter() {
            for topic in topic::subscriptions(device) {
                self.bus.subscribe(&topic).await?;
            }
        }
        info!("Subscribed command topics for {} devices", self.registry.len());
        Ok(())
    }

    /// Announce and property-map introspection, per configuration
    pub async fn start(&self) {
        if self.config.announce_on_start {
            if let Err(e) = self.sender.announce().await {
                warn!("Announce failed: {}", e);
            }
        }
        if self.config.introspect_on_start {
            for device in self.registry.iter() {
                let result = match device.query_property_maps() {
                    Ok(frame) => self.sender.send(device, frame).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("{}: property map query failed: {}", device.label(), e);
                }
            }
        }
    }

    /// Run until cancelled
    pub async fn run(
        &self,
        mut events: EventReceiver,
        mut inbound: InboundReceiver,
        cancel: CancellationToken,
    ) {
        let mut poll = time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending = PendingQueries::default();

        info!(
            "Bridge running: {} devices, poll every {:?}",
            self.registry.len(),
            self.config.poll_interval()
        );

        loop {
            let flush_at = pending.deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(message) = inbound.recv() => self.handle_message(message, &mut pending).await,
                _ = poll.tick() => self.poll_all().await,
                _ = wait_until(flush_at) => self.flush(&mut pending).await,
            }
        }
        info!("Bridge stopped");
    }

    /// Publish the state of a changed device, or report a denial
    pub async fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Changed(device) => {
                let snapshot = device.snapshot();
                for (topic, payload) in topic::state_publications(&snapshot) {
                    self.publish(&topic, &payload).await;
                }
            },
            DeviceEvent::Denied {
                device,
                service,
                properties,
            } => {
                let codes = properties
                    .iter()
                    .map(|code| format!("{:02x}", code))
                    .collect::<Vec<_>>()
                    .join(" ");
                let err = EchonetError::DeviceDenied(format!("{} [{}]", service, codes));
                let topic = topic::device_error_topic(device.kind(), device.name());
                self.report(&topic, &err.to_string()).await;
            },
        }
    }

    /// Execute a command, reporting failures on its error topic
    pub async fn handle_message(&self, message: InboundMessage, pending: &mut PendingQueries) {
        match self.execute(&message).await {
            Ok(device) => {
                pending.touch(&device, Instant::now(), self.config.flush_interval());
            },
            Err(err) => {
                warn!("Command {} rejected: {}", message.topic, err);
                self.report(&topic::error_topic(&message.topic), &err.to_string())
                    .await;
            },
        }
    }

    async fn execute(&self, message: &InboundMessage) -> Result<Arc<DeviceObject>, EchonetError> {
        let command = TopicCommand::parse(&message.topic, &message.payload)?;
        let device = self.registry.resolve(command.kind, &command.name)?;
        info!(
            "{}: set {} = {}",
            device.label(),
            command.attribute,
            command.payload
        );
        match command.to_frame(device)? {
            Some(frame) => {
                self.sender.send(device, frame).await?;
            },
            None => debug!("{}: target temperature is automatic, not sent", device.label()),
        }
        Ok(Arc::clone(device))
    }

    /// Query the state of every device
    pub async fn poll_all(&self) {
        debug!("Polling {} devices", self.registry.len());
        for device in self.registry.iter() {
            self.query(device).await;
        }
    }

    /// Query every device touched since the last flush
    pub async fn flush(&self, pending: &mut PendingQueries) {
        for device in pending.take() {
            self.query(&device).await;
        }
    }

    async fn query(&self, device: &Arc<DeviceObject>) {
        let result = match device.query_state() {
            Ok(frame) => self.sender.send(device, frame).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("{}: state query failed: {}", device.label(), e);
        }
    }

    async fn publish(&self, topic: &str, payload: &str) {
        if let Err(e) = self.bus.publish(topic, payload).await {
            warn!("Publish {} failed: {}", topic, e);
        }
    }

    async fn report(&self, topic: &str, payload: &str) {
        if let Err(e) = self.bus.publish_transient(topic, payload).await {
            warn!("Publish {} failed: {}", topic, e);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
