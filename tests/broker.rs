//! Development broker under concurrency and over the wire

mod common;

use common::{TestBroker, TEST_SECRET};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use trainrelay::auth::{sign, Claims};
use trainrelay::channels::Channel;
use trainrelay::relay::{LogRelay, FULL_HISTORY};
use trainrelay::server::{ClientConnection, ConnectionManager, TopicRouter};
use trainrelay::storage::{HistoryStore, MemoryHistoryStore, RingBuffer};
use trainrelay_client::{ClientConfig, RelayClient};

#[tokio::test]
async fn test_connection_manager_concurrent_access() {
    let manager = ConnectionManager::new();

    let mut handles = vec![];
    for i in 0..100 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(10);
            let conn = Arc::new(ClientConnection::new(format!("user-{}", i), None, tx));

            let id = conn.id;
            manager.add(conn);
            tokio::time::sleep(Duration::from_micros(100)).await;
            manager.remove(id);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn test_router_fans_out_to_every_subscriber() {
    let connections = Arc::new(ConnectionManager::new());
    let router = TopicRouter::new(connections.clone());
    let channel = Channel::parse("training_logs").unwrap();
    let other = Channel::parse("training_logs.other").unwrap();

    let mut receivers = vec![];
    for i in 0..10 {
        let (tx, rx) = mpsc::channel(100);
        let conn = Arc::new(ClientConnection::new(format!("user-{}", i), None, tx));
        // Every other client listens elsewhere
        conn.subscribe(if i % 2 == 0 { &channel } else { &other });
        connections.add(conn);
        receivers.push((i, rx));
    }

    for seq in 0..20 {
        let delivered = router.route(&channel, &format!(r#"{{"seq":{}}}"#, seq));
        assert_eq!(delivered, 5);
    }

    for (i, mut rx) in receivers {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        let expected = if i % 2 == 0 { 20 } else { 0 };
        assert_eq!(count, expected, "client {}", i);
    }
}

#[tokio::test]
async fn test_router_tolerates_dead_and_slow_subscribers() {
    let connections = Arc::new(ConnectionManager::new());
    let router = TopicRouter::new(connections.clone());
    let channel = Channel::parse("training_logs").unwrap();

    // Receiver dropped immediately
    let (dead_tx, dead_rx) = mpsc::channel(10);
    drop(dead_rx);
    let dead = Arc::new(ClientConnection::new("dead".to_string(), None, dead_tx));
    dead.subscribe(&channel);
    connections.add(dead);

    // Buffer of one, never drained
    let (slow_tx, mut slow_rx) = mpsc::channel(1);
    let slow = Arc::new(ClientConnection::new("slow".to_string(), None, slow_tx));
    slow.subscribe(&channel);
    connections.add(slow);

    let mut delivered = 0;
    for _ in 0..100 {
        delivered += router.route(&channel, "{}");
    }

    assert_eq!(delivered, 1);
    assert!(slow_rx.try_recv().is_ok());
    assert!(slow_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_ring_buffer_concurrent_access() {
    let buffer = Arc::new(RingBuffer::new(1000));

    let mut write_handles = vec![];
    for i in 0..10 {
        let buffer = buffer.clone();
        write_handles.push(tokio::spawn(async move {
            for j in 0..200 {
                buffer.push(json!({"log": format!("{}-{}", i, j)}));
            }
        }));
    }

    let mut read_handles = vec![];
    for _ in 0..10 {
        let buffer = buffer.clone();
        read_handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                let (entries, _) = buffer.read(FULL_HISTORY);
                // Whatever a reader sees is contiguous and ordered
                for pair in entries.windows(2) {
                    assert_eq!(pair[1].offset, pair[0].offset + 1);
                }
                tokio::time::sleep(Duration::from_micros(10)).await;
            }
        }));
    }

    for handle in write_handles {
        handle.await.unwrap();
    }
    for handle in read_handles {
        handle.await.unwrap();
    }

    assert_eq!(buffer.len(), 1000);
    assert_eq!(buffer.top_offset(), 2000);
    assert_eq!(buffer.oldest_offset(), Some(1001));
}

#[tokio::test]
async fn test_history_store_offsets_per_channel() {
    let store = Arc::new(MemoryHistoryStore::new(100));

    let mut handles = vec![];
    for c in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let channel = format!("training_logs.run-{}", c);
            for j in 0..25 {
                store.append(&channel, json!({"log": j})).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.channel_count(), 4);
    for c in 0..4 {
        let slice = store
            .history(&format!("training_logs.run-{}", c), FULL_HISTORY)
            .await
            .unwrap();
        let offsets: Vec<u64> = slice.publications.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, (1..=25).collect::<Vec<u64>>());
        assert_eq!(slice.offset, 25);
    }
}

#[tokio::test]
async fn test_pushes_reach_other_subscribers() {
    let broker = TestBroker::start();
    let settings = broker.settings();

    let listener = RelayClient::new(
        ClientConfig::new(broker.url()).operation_timeout(Duration::from_secs(5)),
        Arc::new(settings.tokens()),
    );
    listener.connect().await.unwrap();
    let subscription = listener.new_subscription("training_logs");

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        subscription.on_publication(move |_, publication| {
            if let Some(line) = publication.data.get("log").and_then(|v| v.as_str()) {
                received.lock().push(line.to_string());
            }
        });
    }
    subscription.subscribe().await.unwrap();

    let publisher = LogRelay::open(&settings, "training_logs").await.unwrap();
    publisher.publish("Training started").await.unwrap();
    publisher.publish("Training completed").await.unwrap();

    for _ in 0..200 {
        if received.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        *received.lock(),
        vec!["Training started".to_string(), "Training completed".to_string()]
    );

    publisher.disconnect().await;
    listener.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connection_survives_server_pings() {
    let broker = TestBroker::start();
    let relay = LogRelay::open(&broker.settings(), "training_logs").await.unwrap();

    // The fixture pings every second
    tokio::time::sleep(Duration::from_millis(2500)).await;

    relay.publish("still here").await.unwrap();
    assert_eq!(relay.history(FULL_HISTORY).await.unwrap(), vec!["still here"]);
    relay.disconnect().await;
}

fn token(channel: Option<&str>) -> String {
    sign(
        TEST_SECRET.as_bytes(),
        &Claims {
            sub: "42".to_string(),
            channel: channel.map(String::from),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_first_frame_is_handled_in_full() {
    let broker = TestBroker::start();
    let (mut socket, _) = connect_async(broker.url()).await.unwrap();

    let subscribe = json!({"channel": "training_logs", "token": token(Some("training_logs"))});
    let frame = [
        json!({"id": 1, "connect": {"token": token(None)}}).to_string(),
        json!({"id": 2, "subscribe": subscribe}).to_string(),
        r#"{"id":9,"publish":5}"#.to_string(),
    ]
    .join("\n");
    socket.send(Message::text(frame)).await.unwrap();

    let mut replies = Vec::new();
    while replies.len() < 3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("reply in time")
            .expect("socket open")
            .unwrap();
        for line in msg.to_text().unwrap().lines().filter(|l| *l != "{}") {
            replies.push(serde_json::from_str::<Value>(line).unwrap());
        }
    }

    let ids: Vec<u64> = replies.iter().map(|r| r["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 9]);
    assert!(replies[0].get("connect").is_some(), "{}", replies[0]);
    assert!(replies[1].get("error").is_none(), "{}", replies[1]);
    assert_eq!(replies[2]["error"]["code"], 107);
}
