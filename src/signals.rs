//! SIGINT/SIGTERM handling: first signal triggers an orderly shutdown,
//! a second forces immediate exit.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::registry::Registry;

/// Waits for SIGINT or SIGTERM, tells the registry to wind down, then waits
/// for a second signal to force-exit in case shutdown hangs.
pub async fn wait_for_shutdown(registry: Arc<Registry>) {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down: closing all sessions");
    registry.terminate_all();
    registry.trigger_shutdown();

    tokio::select! {
        _ = sigint.recv() => {
            warn!("second signal received, forcing exit");
            std::process::exit(1);
        }
        _ = sigterm.recv() => {
            warn!("second signal received, forcing exit");
            std::process::exit(1);
        }
        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
            info!("shutdown grace period elapsed");
        }
    }
}
