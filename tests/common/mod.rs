//! Shared fixtures: an in-process broker on its own thread and runtime

#![allow(dead_code)]

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use trainrelay::config::RelaySettings;
use trainrelay::server::{RelayServer, RelayServerConfig, WEBSOCKET_PATH};
use trainrelay::storage::{HistoryStore, MemoryHistoryStore};

pub const TEST_SECRET: &str = "secret";

/// A running broker, stopped on drop
///
/// Lives on a dedicated thread so sync tests and `#[tokio::test]`s can share
/// the same fixture without nesting runtimes.
pub struct TestBroker {
    pub addr: SocketAddr,
    server: Arc<RelayServer>,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestBroker {
    pub fn start() -> Self {
        Self::start_with_store(Arc::new(MemoryHistoryStore::new(1000)))
    }

    /// Broker backed by `store`, for scripting storage failures
    pub fn start_with_store(store: Arc<dyn HistoryStore>) -> Self {
        let mut config = RelayServerConfig::new(([127, 0, 0, 1], 0).into(), TEST_SECRET);
        config.ping_interval = Duration::from_secs(1);

        let server = Arc::new(RelayServer::new(config, store));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let serving = server.clone();
        std::thread::Builder::new()
            .name("test-broker".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .expect("broker runtime");

                runtime.block_on(async move {
                    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
                    let addr = listener.local_addr().expect("local addr");
                    ready_tx
                        .send((addr, Handle::current()))
                        .expect("report address");

                    serving
                        .serve_with_shutdown(listener, async {
                            let _ = shutdown_rx.await;
                        })
                        .await
                        .expect("broker serve");
                });
            })
            .expect("spawn broker thread");

        let (addr, handle) = ready_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("broker did not start");

        Self {
            addr,
            server,
            handle,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, WEBSOCKET_PATH)
    }

    /// Demo credentials pointed at this broker
    pub fn settings(&self) -> RelaySettings {
        let mut settings = RelaySettings::new(self.url());
        settings.operation_timeout = Some(Duration::from_secs(5));
        settings
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    /// Publish from inside the broker; awaitable from any runtime
    pub async fn publish(&self, channel: &str, data: Value) -> u64 {
        let server = self.server.clone();
        let channel = channel.to_string();
        self.handle
            .spawn(async move { server.publish(&channel, data).await })
            .await
            .expect("publish task")
            .expect("publish")
    }

    /// Wait until the broker has exactly `n` live connections
    pub async fn wait_for_connections(&self, n: usize) {
        for _ in 0..200 {
            if self.connection_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} connections, broker has {}",
            n,
            self.connection_count()
        );
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
