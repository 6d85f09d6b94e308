use std::future::Future;
use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::api::{self, AppState, SharedState};
use super::ws;
use crate::broker_config::BrokerConfig;
use crate::errors::BrokerError;

/// Build the full application router with the HTTP API and both sockets.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/agent", get(ws::agent_ws_handler))
        .route("/ws", get(ws::dashboard_ws_handler))
        .with_state(state)
}

/// Bind the configured address and run until Ctrl+C.
pub async fn start_server(config: BrokerConfig) -> Result<(), BrokerError> {
    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| BrokerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    serve(listener, &config, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    config: &BrokerConfig,
    shutdown: F,
) -> Result<(), BrokerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(config);
    let mut app = build_router(state);

    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let local_addr: SocketAddr = listener.local_addr().map_err(anyhow::Error::from)?;
    info!(
        addr = %local_addr,
        superseded = %config.registry.superseded,
        dev_mode = config.server.dev_mode,
        "Agent broker listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::Error::from(e).context("Server error"))?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
