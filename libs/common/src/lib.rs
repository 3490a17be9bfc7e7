//! Shared service plumbing for the echonet bridge services
//!
//! Provides the pieces every service binary needs:
//! - logging initialisation
//! - layered configuration loading
//! - graceful shutdown signalling
//! - hex helpers for wire dumps

pub mod config_loader;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_config, ConfigLoadError};
pub use logging::LogConfig;
pub use shutdown::{shutdown_token, wait_for_shutdown};

// Re-export common dependencies
pub use tokio;
pub use tokio_util;
