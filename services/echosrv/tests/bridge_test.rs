//! Bridge behaviour against an in-memory bus and frame sender

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use voltage_echonet::constants::{EDT_ON, EPC_GET_MAP, EPC_MODE, EPC_POWER, EPC_ROOM_TEMP, EPC_WATT};
use voltage_echonet::{
    event_channel, DeviceConfig, DeviceEvent, DeviceKind, DeviceObject, EventReceiver, Frame,
    FrameSender, ObjectCode, Registry, ServiceCode,
};

use echosrv::config::BridgeConfig;
use echosrv::{inbound_channel, Bridge, InboundMessage, MessageBus, PendingQueries};

#[derive(Default)]
struct RecordingBus {
    subscriptions: Mutex<Vec<String>>,
    /// (topic, payload, retained)
    published: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingBus {
    fn payload(&self, topic: &str) -> Option<String> {
        self.published
            .lock()
            .iter()
            .rev()
            .find(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
    }

    fn retained(&self, topic: &str) -> Option<bool> {
        self.published
            .lock()
            .iter()
            .rev()
            .find(|(t, _, _)| t == topic)
            .map(|(_, _, retained)| *retained)
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn subscribe(&self, topic: &str) -> echosrv::Result<()> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> echosrv::Result<()> {
        self.published
            .lock()
            .push((topic.to_string(), payload.to_string(), true));
        Ok(())
    }

    async fn publish_transient(&self, topic: &str, payload: &str) -> echosrv::Result<()> {
        self.published
            .lock()
            .push((topic.to_string(), payload.to_string(), false));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, Frame)>>,
    announces: Mutex<usize>,
}

impl RecordingSender {
    fn sent_with(&self, esv: ServiceCode) -> Vec<(String, Frame)> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, f)| f.esv == esv)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FrameSender for RecordingSender {
    async fn send(&self, device: &DeviceObject, mut frame: Frame) -> voltage_echonet::Result<u16> {
        let tid = device.next_tid();
        frame.tid = tid;
        self.sent.lock().push((device.label(), frame));
        Ok(tid)
    }

    async fn announce(&self) -> voltage_echonet::Result<()> {
        *self.announces.lock() += 1;
        Ok(())
    }
}

struct Fixture {
    registry: Arc<Registry>,
    sender: Arc<RecordingSender>,
    bus: Arc<RecordingBus>,
    bridge: Arc<Bridge>,
    events: EventReceiver,
}

fn fixture(config: BridgeConfig) -> Fixture {
    let (tx, events) = event_channel(16);
    let registry = Arc::new(
        Registry::from_configs(
            &[
                DeviceConfig::new(
                    DeviceKind::Aircon,
                    "living",
                    Ipv4Addr::new(192, 168, 1, 20),
                    ObjectCode::new(0x013001),
                ),
                DeviceConfig::new(
                    DeviceKind::Light,
                    "hall",
                    Ipv4Addr::new(192, 168, 1, 30),
                    ObjectCode::new(0x029001),
                ),
            ],
            &tx,
        )
        .unwrap(),
    );
    let sender = Arc::new(RecordingSender::default());
    let bus = Arc::new(RecordingBus::default());
    let bridge = Arc::new(Bridge::new(
        Arc::clone(&registry),
        sender.clone(),
        bus.clone(),
        config,
    ));
    Fixture {
        registry,
        sender,
        bus,
        bridge,
        events,
    }
}

fn message(topic: &str, payload: &str) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn test_subscribe_all_covers_every_device() {
    let f = fixture(BridgeConfig::default());
    f.bridge.subscribe_all().await.unwrap();

    let subs = f.bus.subscriptions.lock().clone();
    assert_eq!(subs.len(), 7);
    assert!(subs.contains(&"light/hall/power/set".to_string()));
    assert!(subs.contains(&"aircon/living/temperature/set".to_string()));
}

#[tokio::test]
async fn test_command_sends_frame_and_marks_pending() {
    let f = fixture(BridgeConfig::default());
    let mut pending = PendingQueries::default();

    f.bridge
        .handle_message(message("aircon/living/mode/set", "cool"), &mut pending)
        .await;

    let sent = f.sender.sent_with(ServiceCode::SetI);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "aircon/living");
    assert_eq!(sent[0].1.property(EPC_POWER).unwrap().data, vec![EDT_ON]);
    assert_eq!(sent[0].1.property(EPC_MODE).unwrap().data, vec![0x42]);
    assert_eq!(pending.len(), 1);
    assert!(f.bus.published.lock().is_empty());
}

#[tokio::test]
async fn test_rejected_commands_publish_errors() {
    let f = fixture(BridgeConfig::default());
    let mut pending = PendingQueries::default();

    f.bridge
        .handle_message(message("aircon/living/mode/set", "turbo"), &mut pending)
        .await;
    f.bridge
        .handle_message(message("aircon/living/temperature/set", "99"), &mut pending)
        .await;
    f.bridge
        .handle_message(message("aircon/bedroom/power/set", "on"), &mut pending)
        .await;

    assert!(f
        .bus
        .payload("aircon/living/mode/error")
        .unwrap()
        .contains("Invalid argument"));
    assert!(f
        .bus
        .payload("aircon/living/temperature/error")
        .unwrap()
        .contains("out of range"));
    assert!(f
        .bus
        .payload("aircon/bedroom/power/error")
        .unwrap()
        .contains("Unknown device"));
    assert!(f.bus.published.lock().iter().all(|(_, _, retained)| !retained));
    assert!(f.sender.sent.lock().is_empty());
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_changed_event_publishes_state() {
    let f = fixture(BridgeConfig::default());
    let device = Arc::clone(f.registry.get(DeviceKind::Aircon, "living").unwrap());

    let mut maps = Frame::new(ObjectCode::new(0x013001), ObjectCode::NODE_PROFILE, ServiceCode::GetRes);
    maps.add_property(EPC_GET_MAP, vec![0x02, EPC_POWER, EPC_WATT]).unwrap();
    device.apply_response(&maps);

    let mut reply = Frame::new(ObjectCode::new(0x013001), ObjectCode::NODE_PROFILE, ServiceCode::GetRes);
    reply.add_property(EPC_POWER, vec![EDT_ON]).unwrap();
    reply.add_property(EPC_MODE, vec![0x43]).unwrap();
    reply.add_property(EPC_ROOM_TEMP, vec![19]).unwrap();
    reply.add_property(EPC_WATT, vec![0x01, 0x2C]).unwrap();
    device.apply_response(&reply);

    f.bridge.handle_event(DeviceEvent::Changed(device)).await;

    assert_eq!(f.bus.payload("aircon/living/power").unwrap(), "on");
    assert_eq!(f.bus.payload("aircon/living/mode").unwrap(), "heat");
    assert_eq!(f.bus.payload("sensor/aircon/living/temperature").unwrap(), "19");
    assert_eq!(f.bus.payload("sensor/aircon/living/watt").unwrap(), "300");
}

#[tokio::test]
async fn test_property_map_reply_publishes_nothing() {
    let mut f = fixture(BridgeConfig::default());
    let device = Arc::clone(f.registry.get(DeviceKind::Aircon, "living").unwrap());

    let mut maps = Frame::new(ObjectCode::new(0x013001), ObjectCode::NODE_PROFILE, ServiceCode::GetRes);
    maps.add_property(EPC_GET_MAP, vec![0x02, EPC_POWER, EPC_WATT]).unwrap();
    assert!(!device.handle_response(&maps).await);

    while let Ok(event) = f.events.try_recv() {
        f.bridge.handle_event(event).await;
    }
    assert!(f.bus.published.lock().is_empty());

    let mut reply = Frame::new(ObjectCode::new(0x013001), ObjectCode::NODE_PROFILE, ServiceCode::GetRes);
    reply.add_property(EPC_POWER, vec![EDT_ON]).unwrap();
    assert!(device.handle_response(&reply).await);
    let event = f.events.try_recv().unwrap();
    f.bridge.handle_event(event).await;

    assert_eq!(f.bus.payload("aircon/living/power").unwrap(), "on");
    assert_eq!(f.bus.retained("aircon/living/power"), Some(true));
    assert_eq!(f.bus.payload("sensor/aircon/living/watt").unwrap(), "0");
}

#[tokio::test]
async fn test_denied_event_publishes_device_error() {
    let f = fixture(BridgeConfig::default());
    let device = Arc::clone(f.registry.get(DeviceKind::Light, "hall").unwrap());

    f.bridge
        .handle_event(DeviceEvent::Denied {
            device,
            service: ServiceCode::SetISna,
            properties: vec![EPC_POWER],
        })
        .await;

    assert_eq!(f.bus.retained("light/hall/error"), Some(false));
    let payload = f.bus.payload("light/hall/error").unwrap();
    assert!(payload.contains("denied"), "{}", payload);
    assert!(payload.contains("80"), "{}", payload);
}

#[tokio::test]
async fn test_start_announces_and_introspects() {
    let f = fixture(BridgeConfig {
        announce_on_start: true,
        introspect_on_start: true,
        ..Default::default()
    });
    f.bridge.start().await;

    assert_eq!(*f.sender.announces.lock(), 1);
    let gets = f.sender.sent_with(ServiceCode::Get);
    assert_eq!(gets.len(), 2);
    assert!(gets.iter().all(|(_, frame)| frame.property(EPC_GET_MAP).is_some()));
}

#[tokio::test(start_paused = true)]
async fn test_run_polls_then_debounces_requery() {
    let f = fixture(BridgeConfig {
        flush_interval_ms: 1000,
        ..Default::default()
    });
    let (inbound_tx, inbound_rx) = inbound_channel(8);
    let cancel = CancellationToken::new();

    let bridge = Arc::clone(&f.bridge);
    let loop_cancel = cancel.clone();
    let events = f.events;
    let handle = tokio::spawn(async move { bridge.run(events, inbound_rx, loop_cancel).await });

    // Initial poll queries both devices
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.sender.sent_with(ServiceCode::Get).len(), 2);

    inbound_tx
        .send(message("aircon/living/power/set", "on"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    inbound_tx
        .send(message("aircon/living/fan/set", "high"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(f.sender.sent_with(ServiceCode::SetI).len(), 2);
    // Second command pushed the deadline out
    assert_eq!(f.sender.sent_with(ServiceCode::Get).len(), 2);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let gets = f.sender.sent_with(ServiceCode::Get);
    assert_eq!(gets.len(), 3);
    assert_eq!(gets[2].0, "aircon/living");

    cancel.cancel();
    handle.await.unwrap();
}
