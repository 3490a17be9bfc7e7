//! echosrv entry point

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use echosrv::bootstrap::{self, Args};
use echosrv::{inbound_channel, Bridge, EchoSrvConfig, MqttBus};
use voltage_echonet::{event_channel, FrameSender, Registry, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = EchoSrvConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    bootstrap::initialize_logging(&args, &config)?;
    bootstrap::describe_configuration(&config);

    if args.validate {
        // Registry construction catches duplicate devices
        let (events, _) = event_channel(1);
        Registry::from_configs(&config.devices, &events)?;
        info!("Validation completed successfully");
        return Ok(());
    }

    let cancel = common::shutdown_token();

    // ============ Phase 1: devices and transport ============
    let (events_tx, events_rx) = event_channel(config.bridge.queue_capacity);
    let registry = Arc::new(Registry::from_configs(&config.devices, &events_tx)?);
    drop(events_tx);

    let transport = Arc::new(
        Transport::open(config.transport.clone(), Arc::clone(&registry), cancel.clone())
            .await
            .context("opening ECHONET Lite sockets")?,
    );
    info!("Listening on {:?}", transport.local_addrs());

    // ============ Phase 2: MQTT ============
    let (inbound_tx, inbound_rx) = inbound_channel(config.bridge.queue_capacity);
    let bus = Arc::new(MqttBus::connect(
        &config.mqtt,
        config.bridge.queue_capacity,
        inbound_tx,
        &cancel,
    )?);

    // ============ Phase 3: bridge loop ============
    let sender: Arc<dyn FrameSender> = transport.clone();
    let bridge = Bridge::new(
        Arc::clone(&registry),
        sender,
        bus.clone(),
        config.bridge.clone(),
    );
    if let Err(e) = bridge.subscribe_all().await {
        error!("Subscribing command topics failed: {}", e);
    }
    bridge.start().await;
    bridge.run(events_rx, inbound_rx, cancel.clone()).await;

    // ============ Shutdown ============
    transport.shutdown().await;
    bus.disconnect().await;
    info!("echosrv stopped");
    Ok(())
}
