//! Development broker
//!
//! Speaks the same WebSocket protocol as the production broker for the
//! subset the relay uses: token-authenticated connect, token-scoped
//! subscribe, publish with fan-out, and channel history.

mod connections;
pub mod protocol;
mod router;
pub mod websocket;

pub use connections::{ClientConnection, ConnectionManager, OutboundFrame};
pub use router::TopicRouter;
pub use websocket::{create_router, WsState, WEBSOCKET_PATH};

use crate::auth::TokenVerifier;
use crate::channels::Channel;
use crate::storage::HistoryStore;

use anyhow::{Context, Result};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Broker configuration
#[derive(Clone)]
pub struct RelayServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Secret shared with the token issuer
    pub token_secret: Vec<u8>,
    /// Publications retained per channel
    pub history_size: usize,
    /// Interval between server pings
    pub ping_interval: Duration,
    /// Per-connection outbound queue capacity
    pub outbound_capacity: usize,
}

impl RelayServerConfig {
    pub fn new(bind_addr: SocketAddr, token_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            bind_addr,
            token_secret: token_secret.into(),
            history_size: 1000,
            ping_interval: Duration::from_secs(25),
            outbound_capacity: 100,
        }
    }
}

/// The broker
pub struct RelayServer {
    config: RelayServerConfig,
    connections: Arc<ConnectionManager>,
    router: Arc<TopicRouter>,
    history: Arc<dyn HistoryStore>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig, history: Arc<dyn HistoryStore>) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let router = Arc::new(TopicRouter::new(connections.clone()));

        Self {
            config,
            connections,
            router,
            history,
        }
    }

    fn state(&self) -> WsState {
        WsState {
            connections: self.connections.clone(),
            router: self.router.clone(),
            history: self.history.clone(),
            verifier: TokenVerifier::new(self.config.token_secret.clone()),
            ping_interval: self.config.ping_interval,
            outbound_capacity: self.config.outbound_capacity,
        }
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    /// Publish from inside the broker, bypassing client permissions
    ///
    /// Returns the assigned offset.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<u64> {
        let channel = Channel::parse(channel).context("Invalid channel name")?;
        let stored = self
            .history
            .append(channel.as_str(), data)
            .await
            .context("Failed to store publication")?;
        let offset = stored.offset;

        websocket::broadcast(&self.router, &channel, stored);
        Ok(offset)
    }

    /// Bind the configured address and serve until the process exits
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `signal` resolves
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, path = WEBSOCKET_PATH, "Broker listening");

        axum::serve(listener, create_router(self.state()))
            .with_graceful_shutdown(signal)
            .await?;

        info!("Broker stopped");
        Ok(())
    }
}
