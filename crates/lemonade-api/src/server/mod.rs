//! HTTP server assembly.

pub mod router;
pub mod state;

pub use router::create_router;
pub use state::ServerState;

use std::net::SocketAddr;

use lemonade_core::{Error, Result};

/// Bind and serve until shutdown. Unloads every backend on the way out so no
/// child processes are orphaned.
pub async fn serve(state: ServerState, host: &str, port: u16) -> Result<()> {
    let app = create_router(state.clone());

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::config(format!("invalid listen address {host}:{port}: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("could not bind {addr}: {e}")))?;
    tracing::info!("server listening on http://{addr}");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutting down, unloading all models...");
            shutdown_state.router.unload_all().await;
        })
        .await
        .map_err(|e| Error::internal(format!("server error: {e}")))?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
