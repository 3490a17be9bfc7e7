//! Unified logging module for the bridge services
//!
//! Console output plus an optional daily-rolling log file, both rendered as
//! `timestamp [LEVEL] message`.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809113Z [INFO] Send: 192.168.1.20 EOJ:0ef001=>013001 ...`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the process lifetime
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the log file prefix and default filter target
    pub service_name: String,
    /// Additional crate targets that follow the console level (e.g. `voltage_echonet`)
    pub targets: Vec<String>,
    /// Directory for the rolling log file; `None` logs to the console only
    pub log_dir: Option<PathBuf>,
    /// Console log level
    pub console_level: Level,
    /// File log level
    pub file_level: Level,
    /// Emit JSON lines to the log file instead of the bracketed format
    pub enable_json: bool,
    /// Colourise console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            targets: Vec::new(),
            log_dir: None,
            console_level: Level::INFO,
            file_level: Level::DEBUG,
            enable_json: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Filter applied when `RUST_LOG` is not set
    fn default_filter(&self) -> String {
        let finest = self.console_level.max(self.file_level_if_enabled());
        let mut filter = format!("info,{}={}", self.service_name, finest.as_str());
        for target in &self.targets {
            filter.push_str(&format!(",{}={}", target, finest.as_str()));
        }
        filter
    }

    fn file_level_if_enabled(&self) -> Level {
        if self.log_dir.is_some() {
            self.file_level
        } else {
            // Level ordering: ERROR is the "smallest" verbosity
            Level::ERROR
        }
    }
}

/// Parse a level string, falling back to `default` on unknown input
pub fn parse_level(level: &str, default: Level) -> Level {
    level.parse().unwrap_or(default)
}

/// Initialize logging system with configuration
///
/// Returns an error if a global subscriber is already installed or the log
/// directory cannot be created.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.is_empty() => EnvFilter::try_new(env_str)?,
        _ => EnvFilter::try_new(config.default_filter())?,
    };

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .with_filter(LevelFilter::from_level(config.console_level))
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_filter(LevelFilter::from_level(config.file_level))
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .with_filter(LevelFilter::from_level(config.file_level))
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::info!("Logging: {} (console only)", config.service_name),
    }

    Ok(())
}

/// Console-only initialisation at the given level
pub fn init(service_name: &str, level: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_with_config(LogConfig {
        service_name: service_name.to_string(),
        console_level: parse_level(level, Level::INFO),
        ..Default::default()
    })
}
