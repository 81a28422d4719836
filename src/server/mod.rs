//! HTTP gateway.
//!
//! Exposes task submission, per-task event streams (SSE) and a health
//! probe over axum. The scheduler loop runs alongside the listener and
//! both stop when the shutdown token is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::core::Gateway;

pub mod handlers;

/// Shared application state
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Build the router over an existing gateway
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    let state = Arc::new(AppState { gateway });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/submit-task", post(handlers::submit_task))
        .route("/stream/{task_id}", get(handlers::stream_task))
        .route("/health", get(handlers::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A bound listener with its gateway, ready to serve
pub struct Server {
    listener: TcpListener,
    gateway: Arc<Gateway>,
}

impl Server {
    /// Bind the configured address and wire up the gateway
    pub async fn bind(config: &ResolvedConfig) -> Result<Self> {
        let gateway = Arc::new(Gateway::from_config(config)?);
        let listener = TcpListener::bind(&config.server.address)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.address))?;

        Ok(Self { listener, gateway })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// On shutdown the broadcaster is closed so that open streams end and
    /// in-flight connections can drain.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let scheduler = self.gateway.start(shutdown.clone());

        let broadcaster = Arc::clone(self.gateway.broadcaster());
        let app = create_router(self.gateway);

        info!("Gateway listening on http://{}", addr);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Shutdown requested, closing event streams");
                broadcaster.close();
            })
            .await
            .context("HTTP server failed")?;

        if let Err(e) = scheduler.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// Bind and serve `config` until `shutdown` is cancelled
pub async fn serve(config: &ResolvedConfig, shutdown: CancellationToken) -> Result<()> {
    Server::bind(config).await?.run(shutdown).await
}
