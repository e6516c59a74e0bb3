use anyhow::Result;
use relaycast_api::{create_router, AppState};
use relaycast_sfu::{LoopbackEngine, MediaEngine, SfuManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::Config;

/// Serve signaling until SIGINT or SIGTERM, then close every connection
pub async fn serve(config: Config) -> Result<()> {
    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::from_config(&config.sfu));
    let manager = SfuManager::new(config.sfu.clone(), engine);
    info!(
        codecs = config.sfu.media_codecs.len(),
        rtc_min_port = config.sfu.rtc_min_port,
        rtc_max_port = config.sfu.rtc_max_port,
        "SFU manager initialized"
    );

    let state = AppState::new(Arc::clone(&manager))
        .with_max_message_size(config.server.max_message_size);
    let router = create_router(state);

    let address = config.http_address();
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{address}': {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {addr}: {e}"))?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("HTTP server shut down gracefully");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
