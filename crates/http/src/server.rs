use std::net::SocketAddr;
use std::sync::Arc;

use engine::RuntimeEngine;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::router::app_router;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("HTTP server exited: {0}")]
    Serve(std::io::Error),
}

pub async fn serve_http(engine: Arc<RuntimeEngine>, port: u16) -> Result<(), ServeError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    tracing::info!("wtlocal listening on {}", addr);
    serve_listener(listener, engine).await
}

/// Serves on an already bound listener until ctrl-c.
pub async fn serve_listener(listener: TcpListener, engine: Arc<RuntimeEngine>) -> Result<(), ServeError> {
    let app = app_router(engine).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServeError::Serve)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
