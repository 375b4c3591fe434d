//! Configuration for the relay client

use std::time::Duration;

/// Configuration for connecting to a broker
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint (e.g., "ws://localhost:8000/connection/websocket")
    pub url: String,

    /// Optional client name sent with the connect command
    pub name: Option<String>,

    /// Timeout for connect/subscribe/publish/history; `None` leaves it to the transport
    pub operation_timeout: Option<Duration>,

    /// Capacity of the outbound command queue
    pub outbound_capacity: usize,
}

impl ClientConfig {
    /// Create a new configuration for the given endpoint
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            operation_timeout: None,
            outbound_capacity: 100,
        }
    }

    /// Set the client name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bound every broker round trip by `timeout`
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}
