//! WebSocket supervisor for long-running shell commands.
//!
//! A client connects to [`config::WEBSOCKET_PATH`], asks the server to
//! `execute` a command, and receives its output line by line while it can
//! pause, resume or cancel the whole process group. Sessions outlive their
//! connection for a grace window so a client can reconnect and replay what it
//! missed.

pub mod cli;
pub mod config;
pub mod control;
pub(crate) mod dispatcher;
pub(crate) mod execution;
pub mod router;
pub mod session;
pub mod stream;
pub mod supervisor;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

pub use config::{ConfigError, ServerConfig};
pub use router::{build_router, AppState};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid listen address {addr}: {message}")]
    Addr { addr: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binds the configured address and serves until ctrl-c or SIGTERM.
pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let state = Arc::new(AppState::new(config)?);
    let addr = format!("{}:{}", state.config().host, state.config().port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| ServerError::Addr {
            addr: addr.clone(),
            message: err.to_string(),
        })?;
    tracing::info!(
        addr = %addr,
        path = config::WEBSOCKET_PATH,
        max_sessions = state.config().max_sessions,
        "server listening"
    );
    serve(listener, state, shutdown_signal()).await
}

/// Serves `state` on an already bound listener. Once `shutdown` resolves the
/// server stops accepting, closes every session and waits for their
/// processes to be reaped.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reaper = state.sessions().spawn_idle_reaper();
    let router = build_router(state.clone());
    let shutdown_state = state.clone();

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutting down");
            shutdown_state.sessions().shutdown().await;
        })
        .await;

    reaper.abort();
    result.map_err(ServerError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
