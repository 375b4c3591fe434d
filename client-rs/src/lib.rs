//! Trainrelay Rust Client
//!
//! A WebSocket client for the trainrelay broker protocol (a JSON subset of the
//! Centrifugo client protocol): authenticated connect, token-scoped channel
//! subscriptions, acknowledged publishes and history retrieval.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trainrelay_client::{ClientConfig, RelayClient, TokenSource};
//!
//! # async fn run(tokens: Arc<dyn TokenSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let client = RelayClient::new(
//!     ClientConfig::new("ws://localhost:8000/connection/websocket"),
//!     tokens,
//! );
//! client.connect().await?;
//!
//! let sub = client.new_subscription("training_logs");
//! sub.subscribe().await?;
//! sub.publish(&serde_json::json!({"log": "Training started"})).await?;
//!
//! let history = sub.history(-1).await?;
//! println!("{} records", history.publications.len());
//!
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod messages;
mod token;

pub use client::{ConnectionState, PublicationHandler, RelayClient, Subscription};
pub use config::ClientConfig;
pub use error::{RelayError, Result};
pub use messages::{Command, HistoryResult, Publication, Push, Reply};
pub use token::TokenSource;
