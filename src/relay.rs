//! Training log relay
//!
//! A `LogRelay` owns exactly one broker connection and one subscription.
//! Status lines are published as `{"log": "<line>"}` records; history is
//! read back as the ordered list of `log` strings.

use crate::config::RelaySettings;
use crate::runtime::{block_on_isolated, RuntimeError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use trainrelay_client::{ClientConfig, Publication, RelayClient, RelayError, Subscription};

/// History limit meaning "everything, oldest first"
pub const FULL_HISTORY: i64 = -1;

#[derive(Serialize)]
struct LogRecord<'a> {
    log: &'a str,
}

/// `log` strings of `publications`, in order
///
/// Only records without a string `log` are dropped; an empty `log` comes
/// back as an empty line.
pub fn extract_logs(publications: &[Publication]) -> Vec<String> {
    publications
        .iter()
        .filter_map(|p| p.data.get("log").and_then(|v| v.as_str()))
        .map(String::from)
        .collect()
}

/// One connection plus one subscription, publishing status lines
pub struct LogRelay {
    client: RelayClient,
    subscription: Subscription,
}

impl LogRelay {
    /// Build an unconnected relay for `channel`
    pub fn new(settings: &RelaySettings, channel: &str) -> Self {
        let mut config = ClientConfig::new(settings.url.clone()).name("trainrelay");
        if let Some(timeout) = settings.operation_timeout {
            config = config.operation_timeout(timeout);
        }

        let client = RelayClient::new(config, Arc::new(settings.tokens()));
        let subscription = client.new_subscription(channel);

        Self {
            client,
            subscription,
        }
    }

    /// Connect and subscribe
    pub async fn open(settings: &RelaySettings, channel: &str) -> Result<Self, RelayError> {
        let relay = Self::new(settings, channel);
        relay.connect().await?;
        if let Err(e) = relay.subscribe().await {
            relay.disconnect().await;
            return Err(e);
        }
        Ok(relay)
    }

    pub fn channel(&self) -> &str {
        self.subscription.channel()
    }

    /// Suspends until the broker accepted the connection token
    pub async fn connect(&self) -> Result<(), RelayError> {
        self.client.connect().await
    }

    /// Suspends until the broker acknowledged the subscription
    pub async fn subscribe(&self) -> Result<(), RelayError> {
        self.subscription.subscribe().await?;
        info!(channel = %self.channel(), "Log relay subscribed");
        Ok(())
    }

    /// Publish one status line; no retry on failure
    pub async fn publish(&self, message: &str) -> Result<(), RelayError> {
        self.subscription
            .publish(&LogRecord { log: message })
            .await?;
        debug!(channel = %self.channel(), message = message, "Published log line");
        Ok(())
    }

    /// Status lines in publish order; `FULL_HISTORY` for all of them
    pub async fn history(&self, limit: i64) -> Result<Vec<String>, RelayError> {
        let history = self.subscription.history(limit).await?;
        Ok(extract_logs(&history.publications))
    }

    /// Tear down the connection; never fails
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Error while disconnecting log relay");
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Fetch the full history of `channel` on a dedicated event loop
///
/// Safe to call from sync code and from inside another runtime.
pub fn fetch_logs(settings: &RelaySettings, channel: &str) -> Result<Vec<String>, FetchError> {
    let settings = settings.clone();
    let channel = channel.to_string();

    let logs = block_on_isolated("relay-fetch", async move {
        let relay = LogRelay::open(&settings, &channel).await?;
        let result = relay.history(FULL_HISTORY).await;
        relay.disconnect().await;
        result
    })??;

    Ok(logs)
}
