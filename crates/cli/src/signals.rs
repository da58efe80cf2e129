//! Graceful shutdown signal handling for daemon mode.

use std::sync::atomic::Ordering;

use tracing::{error, info};

use ariadne_core::scheduler::{new_shutdown_flag, ShutdownFlag};

/// Create a shutdown flag that is set on SIGINT (Ctrl+C) or SIGTERM.
pub fn setup_signal_handlers() -> ShutdownFlag {
    let flag = new_shutdown_flag();
    let flag_clone = flag.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        flag_clone.store(true, Ordering::SeqCst);
    });

    flag
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler, listening for Ctrl+C only");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for Ctrl+C");
                // Keep waiting on SIGTERM alone.
                sigterm.recv().await;
                info!("received SIGTERM, initiating shutdown");
                return;
            }
            info!("received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, initiating shutdown"),
        Err(e) => {
            error!(error = %e, "failed to listen for Ctrl+C, shutdown only via idle limit");
            std::future::pending::<()>().await;
        }
    }
}
