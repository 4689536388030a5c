//! Server bootstrap: tracing setup, graceful shutdown

use axum::Router;
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::error::ApiError;

/// Initialize the tracing subscriber once per process
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,auditd_api=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Serve the router until SIGINT/SIGTERM, then drain in-flight requests.
///
/// `shutdown_tx` is flipped when the signal arrives so background workers
/// (expiration sweep, socket listener) stop alongside the acceptor.
pub async fn run(
    addr: SocketAddr,
    app: Router,
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), ApiError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::Internal(format!("bind {}: {}", addr, e)))?;
    info!("auditd listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .map_err(|e| ApiError::Internal(format!("server error: {}", e)))?;

    info!("server shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        }
    }
}
