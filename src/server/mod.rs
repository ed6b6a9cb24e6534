//! HTTP and WebSocket front end
//!
//! Accepts client connections, checks the requested channel and hands each
//! upgraded socket to the [`EventHub`].

pub mod urls;
pub mod websocket;

pub use websocket::{create_router, serve_websocket, WsPeer, WsSink, WsState};

use crate::hub::EventHub;
use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Server configuration
#[derive(Debug, Clone)]
pub struct EventServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Path prefix all routes are served under
    pub base_path: String,
    /// Public URL advertised to clients, overriding request headers
    pub url_base: Option<String>,
    /// Allow-list patterns shown on the index and status pages
    pub allowed: Vec<String>,
}

/// The event server
pub struct EventServer {
    config: EventServerConfig,
    hub: Arc<EventHub>,
}

impl EventServer {
    pub fn new(config: EventServerConfig, hub: Arc<EventHub>) -> Self {
        Self { config, hub }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    fn state(&self) -> WsState {
        WsState {
            hub: self.hub.clone(),
            base_path: self.config.base_path.clone(),
            url_base: self.config.url_base.clone(),
            allowed: self.config.allowed.clone(),
        }
    }

    /// Router without a bound listener, for embedding
    pub fn router(&self) -> Router {
        create_router(self.state())
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                shutdown.cancel();
                return Err(e.into());
            }
        };
        self.serve(listener, shutdown).await
    }

    /// Serve on `listener` until `shutdown` fires, then stop every session
    /// and listener
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            base_path = %self.config.base_path,
            "event server listening"
        );

        // Websocket sessions outlive axum's graceful shutdown, so the hub
        // has to be told separately
        let hub = self.hub.clone();
        let stop_sessions = shutdown.clone();
        let sessions = tokio::spawn(async move {
            stop_sessions.cancelled().await;
            hub.shutdown().await
        });

        let served = serve_websocket(listener, self.state(), shutdown.clone()).await;

        // Serve errors return before anyone cancelled
        shutdown.cancel();
        match sessions.await {
            Ok(true) => {}
            Ok(false) => warn!("some sessions were still open when the server stopped"),
            Err(e) => warn!(error = %e, "session shutdown task failed"),
        }

        served
    }
}
