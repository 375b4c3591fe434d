//! Credential supply for connect and subscribe

use async_trait::async_trait;

/// Supplies the credentials the broker asks for
///
/// Called once per `connect()` and once per `subscribe()`, so implementations
/// may mint a fresh token every time.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Token authorizing the connection itself
    async fn connection_token(&self) -> Result<String, String>;

    /// Token authorizing a subscription to `channel`
    async fn subscription_token(&self, channel: &str) -> Result<String, String>;
}
