//! Graceful shutdown utilities
//!
//! Signal handling shared by the service binaries.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received");
    }
}

/// Token that is cancelled once a shutdown signal arrives
///
/// Child tokens handed to long-running tasks stop together with the parent.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        trigger.cancel();
    });
    token
}
