//! SIGINT/SIGTERM and timeout handling.
//!
//! Both cancel the run's token. The assembler then stops any running dump job
//! and closes the archive before returning.

use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wait for SIGINT (Ctrl+C) or SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), cancelling backup");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling backup");
        }
    }
}

/// Cancel `token` on a shutdown signal or once `timeout` elapses.
///
/// The watcher exits quietly if the token is cancelled some other way.
pub fn spawn_watcher(token: CancellationToken, timeout: Option<Duration>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = wait_for_signal() => {}
            _ = deadline => {
                if let Some(limit) = timeout {
                    warn!("Backup did not finish within {}s, cancelling", limit.as_secs());
                }
            }
        }
        token.cancel();
    })
}
