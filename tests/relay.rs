//! Log relay against the in-process broker

mod common;

use async_trait::async_trait;
use common::{TestBroker, TEST_SECRET};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use trainrelay::auth::{Claims, sign};
use trainrelay::relay::{fetch_logs, FetchError, LogRelay, FULL_HISTORY};
use trainrelay_client::{ClientConfig, RelayClient, RelayError, TokenSource};

#[tokio::test]
async fn test_publish_then_history_in_order() {
    let broker = TestBroker::start();
    let relay = LogRelay::open(&broker.settings(), "training_logs").await.unwrap();

    relay.publish("a").await.unwrap();
    relay.publish("b").await.unwrap();

    assert_eq!(relay.history(FULL_HISTORY).await.unwrap(), vec!["a", "b"]);
    relay.disconnect().await;
}

#[tokio::test]
async fn test_sequential_publishes_keep_call_order() {
    let broker = TestBroker::start();
    let relay = LogRelay::open(&broker.settings(), "training_logs").await.unwrap();

    let expected: Vec<String> = (0..50).map(|i| format!("epoch {}", i)).collect();
    for line in &expected {
        relay.publish(line).await.unwrap();
    }

    assert_eq!(relay.history(FULL_HISTORY).await.unwrap(), expected);
    assert_eq!(relay.history(10).await.unwrap(), expected[..10].to_vec());
    assert!(relay.history(0).await.unwrap().is_empty());
    relay.disconnect().await;
}

#[tokio::test]
async fn test_history_drops_records_without_log() {
    let broker = TestBroker::start();
    let relay = LogRelay::open(&broker.settings(), "training_logs").await.unwrap();

    relay.publish("first").await.unwrap();
    broker.publish("training_logs", json!({"metric": 0.5})).await;
    broker.publish("training_logs", json!({"log": 42})).await;
    relay.publish("second").await.unwrap();

    assert_eq!(
        relay.history(FULL_HISTORY).await.unwrap(),
        vec!["first", "second"]
    );
    relay.disconnect().await;
}

#[tokio::test]
async fn test_channels_do_not_mix() {
    let broker = TestBroker::start();
    let settings = broker.settings();
    let run_a = LogRelay::open(&settings, "training_logs.run-a").await.unwrap();
    let run_b = LogRelay::open(&settings, "training_logs.run-b").await.unwrap();

    run_a.publish("from a").await.unwrap();
    run_b.publish("from b").await.unwrap();

    assert_eq!(run_a.history(FULL_HISTORY).await.unwrap(), vec!["from a"]);
    assert_eq!(run_b.history(FULL_HISTORY).await.unwrap(), vec!["from b"]);

    run_a.disconnect().await;
    run_b.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let broker = TestBroker::start();
    let relay = LogRelay::open(&broker.settings(), "training_logs").await.unwrap();
    broker.wait_for_connections(1).await;

    relay.disconnect().await;
    relay.disconnect().await;
    broker.wait_for_connections(0).await;

    assert!(matches!(
        relay.publish("late").await,
        Err(RelayError::NotConnected)
    ));
}

#[test]
fn test_fetch_logs_from_sync_code() {
    let broker = TestBroker::start();
    let settings = broker.settings();

    let published = trainrelay::runtime::block_on_isolated("seed", {
        let settings = settings.clone();
        async move {
            let relay = LogRelay::open(&settings, "training_logs").await?;
            relay.publish("Training started").await?;
            relay.publish("Training completed").await?;
            relay.disconnect().await;
            Ok::<_, RelayError>(())
        }
    })
    .unwrap();
    assert!(published.is_ok());

    let logs = fetch_logs(&settings, "training_logs").unwrap();
    assert_eq!(logs, vec!["Training started", "Training completed"]);
}

#[tokio::test]
async fn test_fetch_logs_inside_a_runtime() {
    let broker = TestBroker::start();
    let relay = LogRelay::open(&broker.settings(), "training_logs").await.unwrap();
    relay.publish("line").await.unwrap();

    // A nested event loop would panic here
    let logs = fetch_logs(&broker.settings(), "training_logs").unwrap();
    assert_eq!(logs, vec!["line"]);
    relay.disconnect().await;
}

#[test]
fn test_concurrent_fetches_are_independent() {
    let broker = TestBroker::start();
    let settings = broker.settings();

    let fetchers: Vec<_> = (0..4)
        .map(|_| {
            let settings = settings.clone();
            std::thread::spawn(move || fetch_logs(&settings, "training_logs"))
        })
        .collect();

    for fetcher in fetchers {
        let logs = fetcher.join().unwrap().unwrap();
        assert!(logs.is_empty());
    }
}

#[test]
fn test_wrong_secret_is_rejected() {
    let broker = TestBroker::start();
    let mut settings = broker.settings();
    settings.secret = "not-the-secret".to_string();

    let result = fetch_logs(&settings, "training_logs");
    assert!(
        matches!(result, Err(FetchError::Relay(RelayError::Authentication(_)))),
        "{:?}",
        result
    );
}

/// Valid connection token, but subscription tokens for a fixed channel
struct MismatchedTokens {
    channel: String,
}

#[async_trait]
impl TokenSource for MismatchedTokens {
    async fn connection_token(&self) -> Result<String, String> {
        sign(
            TEST_SECRET.as_bytes(),
            &Claims {
                sub: "42".to_string(),
                channel: None,
            },
        )
        .map_err(|e| e.to_string())
    }

    async fn subscription_token(&self, _channel: &str) -> Result<String, String> {
        sign(
            TEST_SECRET.as_bytes(),
            &Claims {
                sub: "42".to_string(),
                channel: Some(self.channel.clone()),
            },
        )
        .map_err(|e| e.to_string())
    }
}

#[tokio::test]
async fn test_subscription_token_for_other_channel_is_denied() {
    let broker = TestBroker::start();
    let config = ClientConfig::new(broker.url()).operation_timeout(Duration::from_secs(5));
    let client = RelayClient::new(
        config,
        Arc::new(MismatchedTokens {
            channel: "other_logs".to_string(),
        }),
    );

    client.connect().await.unwrap();
    let subscription = client.new_subscription("training_logs");
    let result = subscription.subscribe().await;

    assert!(
        matches!(result, Err(RelayError::Server { code: 103, .. })),
        "{:?}",
        result
    );
    assert!(!subscription.is_subscribed());
    client.disconnect().await.unwrap();
}
