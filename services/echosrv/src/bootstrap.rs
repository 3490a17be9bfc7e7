//! Command line and logging setup

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};

use crate::config::EchoSrvConfig;
use crate::error::{EchoSrvError, Result};

/// Command-line arguments for echosrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "echosrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "ECHONET Lite to MQTT bridge",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short = 'c', long, env = "ECHOSRV_CONFIG", default_value = "config/echosrv.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Command line level first, then the config file, then `info`
    pub fn console_level(&self, config: &EchoSrvConfig) -> Level {
        let level = self
            .log_level
            .as_deref()
            .or(config.service.log_level.as_deref())
            .unwrap_or("info");
        common::logging::parse_level(level, Level::INFO)
    }
}

/// Install the global subscriber
pub fn initialize_logging(args: &Args, config: &EchoSrvConfig) -> Result<()> {
    let log_config = common::LogConfig {
        service_name: config.service.name.clone(),
        targets: vec!["echosrv".to_string(), "voltage_echonet".to_string()],
        log_dir: config.service.log_dir.clone(),
        console_level: args.console_level(config),
        file_level: Level::DEBUG,
        enable_json: config.service.log_json,
        ansi: !args.no_color,
    };

    common::logging::init_with_config(log_config)
        .map_err(|e| EchoSrvError::config(format!("Failed to init logging: {}", e)))?;
    Ok(())
}

/// Log a summary of a loaded configuration
pub fn describe_configuration(config: &EchoSrvConfig) {
    info!("Service: {}", config.service.name);
    info!("MQTT broker: {}", config.mqtt.broker);
    info!(
        "ECHONET port {} (devices on {}), multicast {}",
        config.transport.listen_port,
        config.transport.device_port,
        if config.transport.multicast { "on" } else { "off" }
    );
    info!("Found {} device(s)", config.devices.len());
    for device in &config.devices {
        info!(
            "  {}/{} at {} (eoj {})",
            device.kind, device.name, device.addr, device.eoj
        );
    }
}
