//! Error types for the relay client

use thiserror::Error;

/// Errors that can occur when talking to the broker
#[derive(Error, Debug)]
pub enum RelayError {
    /// Connection to the broker failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker rejected the connection credential
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Not currently connected to the broker
    #[error("Not connected")]
    NotConnected,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Broker replied with an error
    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    /// Failed to serialize/deserialize a frame
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Could not obtain a token from the token source
    #[error("Token error: {0}")]
    Token(String),

    /// The connection was shut down while an operation was in flight
    #[error("Client shut down")]
    Shutdown,
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
