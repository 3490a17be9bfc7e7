//! MQTT side of the bridge

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::{EchoSrvError, Result};

/// Pause between event loop polls after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type InboundSender = mpsc::Sender<InboundMessage>;
pub type InboundReceiver = mpsc::Receiver<InboundMessage>;

pub fn inbound_channel(capacity: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Publish/subscribe broker as seen by the bridge
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// State publication, retained when configured
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// One-off report (errors), never retained
    async fn publish_transient(&self, topic: &str, payload: &str) -> Result<()>;
}

pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// rumqttc-backed [`MessageBus`]
pub struct MqttBus {
    client: AsyncClient,
    qos: QoS,
    retain: bool,
    topics: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start its event loop
    ///
    /// The broker does not need to be reachable yet; the event loop keeps
    /// retrying and queued requests go out once connected.
    pub fn connect(
        config: &MqttConfig,
        capacity: usize,
        inbound: InboundSender,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let (host, port) = config.endpoint()?;
        let mut options = MqttOptions::new(&config.client_id, &host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, capacity.max(10));
        let qos = qos_from_u8(config.qos);
        let topics = Arc::new(Mutex::new(Vec::new()));
        let cancel = cancel.child_token();

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&topics),
            qos,
            inbound,
            cancel.clone(),
        ));
        info!("MQTT client '{}' -> {}:{}", config.client_id, host, port);

        Ok(Self {
            client,
            qos,
            retain: config.retain,
            topics,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queue a publish without waiting for room in the request queue
    ///
    /// While the broker is unreachable the queue fills up; further
    /// publishes fail instead of stalling the caller.
    fn enqueue(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, self.qos, retain, payload.as_bytes().to_vec())
            .map_err(|e| {
                warn!("Publish {} dropped: {}", topic, e);
                EchoSrvError::mqtt(format!("publish {} failed: {}", topic, e))
            })?;
        debug!("Published {} = {}", topic, payload);
        Ok(())
    }

    /// Topics re-subscribed after every (re)connect
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.topics.lock().clone()
    }

    /// Send DISCONNECT and stop the event loop
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect: {}", e);
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("MQTT event loop task ended abnormally: {}", e);
            }
        }
        info!("MQTT client stopped");
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        {
            let mut topics = self.topics.lock();
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        self.client.subscribe(topic, self.qos).await?;
        debug!("Subscribed {}", topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.enqueue(topic, payload, self.retain)
    }

    async fn publish_transient(&self, topic: &str, payload: &str) -> Result<()> {
        self.enqueue(topic, payload, false)
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Arc<Mutex<Vec<String>>>,
    qos: QoS,
    inbound: InboundSender,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                // Blocking here would stall the client's own request queue
                match inbound.try_send(message) {
                    Ok(()) => {},
                    Err(mpsc::error::TrySendError::Full(message)) => {
                        warn!("Inbound queue full, dropping message on {}", message.topic);
                    },
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Inbound receiver closed");
                        break;
                    },
                }
            },
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT connected ({:?})", ack.code);
                let known = topics.lock().clone();
                if !known.is_empty() {
                    // Subscribing from this task would wait on the queue it drains
                    let client = client.clone();
                    tokio::spawn(async move {
                        for topic in known {
                            if let Err(e) = client.subscribe(topic.as_str(), qos).await {
                                error!("Resubscribe {} failed: {}", topic, e);
                            }
                        }
                    });
                }
            },
            Ok(_) => {},
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                }
            },
        }
    }
    debug!("MQTT event loop exited");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtMostOnce);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_subscriptions_are_tracked_once() {
        let config = MqttConfig {
            // Nothing listens here; the event loop just keeps retrying
            broker: "tcp://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let (tx, _rx) = inbound_channel(4);
        let cancel = CancellationToken::new();
        let bus = MqttBus::connect(&config, 16, tx, &cancel).unwrap();

        bus.subscribe("light/hall/power/set").await.unwrap();
        bus.subscribe("light/hall/power/set").await.unwrap();
        bus.subscribe("aircon/living/mode/set").await.unwrap();
        assert_eq!(
            bus.subscribed_topics(),
            vec!["light/hall/power/set".to_string(), "aircon/living/mode/set".to_string()]
        );
        assert!(logs_contain("MQTT client 'echosrv' -> 127.0.0.1:1"));

        cancel.cancel();
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_publish_fails_fast_when_queue_is_full() {
        let config = MqttConfig {
            broker: "tcp://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let (tx, _rx) = inbound_channel(4);
        let cancel = CancellationToken::new();
        let bus = MqttBus::connect(&config, 10, tx, &cancel).unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            let mut failed = 0;
            for _ in 0..50 {
                if bus.publish("aircon/living/power", "on").await.is_err() {
                    failed += 1;
                }
                if bus
                    .publish_transient("aircon/living/power/error", "denied")
                    .await
                    .is_err()
                {
                    failed += 1;
                }
            }
            failed
        })
        .await
        .expect("publish blocked on a full request queue");
        assert!(failed > 0);

        cancel.cancel();
        bus.disconnect().await;
    }

    #[test]
    fn test_invalid_broker_rejected() {
        let config = MqttConfig {
            broker: "ws://broker:80".to_string(),
            ..Default::default()
        };
        let (tx, _rx) = inbound_channel(1);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(async { MqttBus::connect(&config, 16, tx, &CancellationToken::new()) });
        assert!(result.is_err());
    }
}
