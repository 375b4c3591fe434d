//! Relay client implementation

use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::messages::{
    Command, ConnectRequest, HistoryRequest, HistoryResult, Publication, PublishRequest, Push,
    Reply, SubscribeRequest, UnsubscribeRequest,
};
use crate::token::TokenSource;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to the broker
    Disconnected,
    /// Opening the WebSocket
    Connecting,
    /// Waiting for the broker to accept the connection token
    Authenticating,
    /// Connected and ready
    Connected,
}

/// Handler for publications pushed on a subscribed channel
pub type PublicationHandler = Arc<dyn Fn(&str, &Publication) + Send + Sync>;

/// Internal client state
struct ClientInner {
    config: ClientConfig,
    tokens: Arc<dyn TokenSource>,
    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    client_id: Mutex<Option<String>>,

    // Channel for sending frames to the connection task
    tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,

    // Channels acknowledged by the broker
    subscriptions: Mutex<HashSet<String>>,
    handlers: Mutex<HashMap<String, PublicationHandler>>,

    // Commands awaiting a reply, keyed by command id
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Reply>>>>,

    next_id: AtomicU32,

    // Bumped on every connect/disconnect so a stale connection task cannot
    // tear down a newer session
    generation: AtomicU64,

    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Frame to send to the connection task
enum OutboundMessage {
    Send(Command),
    Shutdown,
}

/// Broker client owning one WebSocket connection
///
/// Cheaply cloneable; clones share the same connection.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

/// A channel subscription bound to its client's connection
///
/// Closing the connection invalidates every subscription created from it.
pub struct Subscription {
    channel: String,
    client: Arc<ClientInner>,
}

impl RelayClient {
    /// Create a new client; nothing is sent until `connect()`
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenSource>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(ClientInner {
            config,
            tokens,
            state: state_tx,
            state_rx,
            client_id: Mutex::new(None),
            tx: Mutex::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            shutdown: Mutex::new(None),
        });

        Self { inner }
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Client id assigned by the broker on connect
    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.lock().clone()
    }

    /// Connect and authenticate; returns once the broker accepted the token
    pub async fn connect(&self) -> Result<()> {
        let current_state = self.connection_state();
        if current_state != ConnectionState::Disconnected {
            return Err(RelayError::Connection(format!(
                "Cannot connect in state: {:?}",
                current_state
            )));
        }

        self.inner.set_state(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let token = self
            .inner
            .tokens
            .connection_token()
            .await
            .map_err(RelayError::Token)?;

        debug!(url = %self.inner.config.url, "Connecting");
        let (mut ws, _) = self
            .inner
            .bounded(connect_async(self.inner.config.url.as_str()))
            .await?
            .map_err(|e| RelayError::Connection(e.to_string()))?;

        self.inner.set_state(ConnectionState::Authenticating);

        let id = self.inner.next_id();
        let connect = Command {
            id,
            connect: Some(ConnectRequest {
                token,
                name: self.inner.config.name.clone(),
            }),
            ..Default::default()
        };
        ws.send(Message::Text(serde_json::to_string(&connect)?.into()))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let reply = self.inner.bounded(await_reply(&mut ws, id)).await??;
        if let Some(err) = reply.error {
            return Err(RelayError::Authentication(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }

        let client_id = reply.connect.map(|c| c.client);
        *self.inner.client_id.lock() = client_id.clone();
        info!(client_id = ?client_id, "Connected to broker");

        let (tx, rx) = mpsc::channel::<OutboundMessage>(self.inner.config.outbound_capacity);
        *self.inner.tx.lock() = Some(tx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.inner.shutdown.lock() = Some(shutdown_tx);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state(ConnectionState::Connected);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = connection_task(inner.clone(), ws, rx, shutdown_rx).await {
                warn!(error = %e, "Connection task ended with error");
            }
            inner.handle_disconnect(generation);
        });

        Ok(())
    }

    /// Close the connection and drop all subscriptions
    ///
    /// Safe to call any number of times; transport errors while closing are ignored.
    pub async fn disconnect(&self) -> Result<()> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let tx = self.inner.tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(OutboundMessage::Shutdown).await;
        }

        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            let _ = shutdown.send(());
        }

        self.inner.handle_disconnect(generation);
        Ok(())
    }

    /// Create a subscription handle for `channel` (not yet subscribed)
    pub fn new_subscription(&self, channel: impl Into<String>) -> Subscription {
        Subscription {
            channel: channel.into(),
            client: self.inner.clone(),
        }
    }
}

impl Subscription {
    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the broker acknowledged this subscription on the live connection
    pub fn is_subscribed(&self) -> bool {
        self.client.subscriptions.lock().contains(&self.channel)
    }

    /// Register a handler for publications pushed on this channel
    pub fn on_publication<F>(&self, handler: F)
    where
        F: Fn(&str, &Publication) + Send + Sync + 'static,
    {
        self.client
            .handlers
            .lock()
            .insert(self.channel.clone(), Arc::new(handler));
    }

    /// Subscribe with a channel-scoped token; returns once the broker acknowledged
    pub async fn subscribe(&self) -> Result<()> {
        self.client.ensure_connected()?;
        if self.is_subscribed() {
            return Ok(());
        }

        let token = self
            .client
            .tokens
            .subscription_token(&self.channel)
            .await
            .map_err(RelayError::Token)?;

        self.client
            .call(Command {
                subscribe: Some(SubscribeRequest {
                    channel: self.channel.clone(),
                    token: Some(token),
                }),
                ..Default::default()
            })
            .await?;

        self.client.subscriptions.lock().insert(self.channel.clone());
        info!(channel = %self.channel, "Subscribed to channel");
        Ok(())
    }

    /// Publish one record; returns once the broker acknowledged it
    pub async fn publish<T: Serialize>(&self, data: &T) -> Result<()> {
        self.client.ensure_connected()?;

        let data = serde_json::to_value(data)?;
        self.client
            .call(Command {
                publish: Some(PublishRequest {
                    channel: self.channel.clone(),
                    data,
                }),
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// Fetch channel history, oldest first; `limit = -1` returns everything
    pub async fn history(&self, limit: i64) -> Result<HistoryResult> {
        self.client.ensure_connected()?;

        let reply = self
            .client
            .call(Command {
                history: Some(HistoryRequest {
                    channel: self.channel.clone(),
                    limit,
                }),
                ..Default::default()
            })
            .await?;

        Ok(reply.history.unwrap_or_default())
    }

    /// Leave the channel; a no-op when not subscribed
    pub async fn unsubscribe(&self) -> Result<()> {
        if !self.is_subscribed() {
            return Ok(());
        }

        self.client
            .call(Command {
                unsubscribe: Some(UnsubscribeRequest {
                    channel: self.channel.clone(),
                }),
                ..Default::default()
            })
            .await?;

        self.client.subscriptions.lock().remove(&self.channel);
        Ok(())
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if *self.state_rx.borrow() != ConnectionState::Connected {
            return Err(RelayError::NotConnected);
        }
        Ok(())
    }

    async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output> {
        match self.config.operation_timeout {
            Some(limit) => timeout(limit, fut).await.map_err(|_| RelayError::Timeout),
            None => Ok(fut.await),
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            tx.send(OutboundMessage::Send(cmd))
                .await
                .map_err(|_| RelayError::NotConnected)
        } else {
            Err(RelayError::NotConnected)
        }
    }

    /// Send a command and wait for the reply carrying the same id
    async fn call(&self, mut cmd: Command) -> Result<Reply> {
        let id = self.next_id();
        cmd.id = id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.send(cmd).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let reply = match self.bounded(rx).await {
            Ok(received) => received.map_err(|_| RelayError::Shutdown)??,
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(e);
            }
        };

        if let Some(err) = reply.error {
            return Err(RelayError::Server {
                code: err.code,
                message: err.message,
            });
        }

        Ok(reply)
    }

    fn handle_reply(&self, reply: Reply) {
        if reply.id == 0 {
            if let Some(push) = reply.push {
                self.dispatch_push(push);
            }
            return;
        }

        if let Some(tx) = self.pending.lock().remove(&reply.id) {
            let _ = tx.send(Ok(reply));
        } else {
            debug!(id = reply.id, "Reply for unknown command");
        }
    }

    fn dispatch_push(&self, push: Push) {
        let Some(publication) = push.publication else {
            return;
        };

        let handler = self.handlers.lock().get(&push.channel).cloned();
        if let Some(handler) = handler {
            handler(&push.channel, &publication);
        }
    }

    fn handle_disconnect(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        *self.tx.lock() = None;
        self.shutdown.lock().take();

        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(RelayError::NotConnected));
        }
        self.subscriptions.lock().clear();

        self.set_state(ConnectionState::Disconnected);
    }
}

/// Split a text frame into replies; the broker may batch several per frame
fn parse_replies(text: &str) -> impl Iterator<Item = Result<Reply>> + '_ {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Reply>(line).map_err(RelayError::from))
}

fn pong_frame() -> Message {
    Message::Text(String::from("{}").into())
}

/// Read frames until the reply for `id` arrives, answering pings meanwhile
async fn await_reply(ws: &mut WsStream, id: u32) -> Result<Reply> {
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| RelayError::Transport(e.to_string()))? {
            Message::Text(text) => {
                for reply in parse_replies(text.as_str()) {
                    let reply = reply?;
                    if reply.id == id {
                        return Ok(reply);
                    }
                    if reply.is_ping() {
                        ws.send(pong_frame())
                            .await
                            .map_err(|e| RelayError::Transport(e.to_string()))?;
                    }
                }
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default();
                return Err(RelayError::Authentication(format!(
                    "connection closed during handshake: {}",
                    reason
                )));
            }
            _ => {}
        }
    }

    Err(RelayError::Connection(
        "Connection closed during handshake".into(),
    ))
}

/// Main connection task: writes queued commands, routes replies and pushes
async fn connection_task(
    inner: Arc<ClientInner>,
    ws: WsStream,
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();

    let result: Result<()> = 'io: loop {
        tokio::select! {
            // Commands are written in the order they were queued
            msg = rx.recv() => {
                match msg {
                    Some(OutboundMessage::Send(cmd)) => {
                        let text = serde_json::to_string(&cmd)?;
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            break 'io Err(RelayError::Transport(e.to_string()));
                        }
                    }
                    Some(OutboundMessage::Shutdown) | None => break 'io Ok(()),
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        for reply in parse_replies(text.as_str()) {
                            match reply {
                                Ok(reply) if reply.is_ping() => {
                                    if let Err(e) = sink.send(pong_frame()).await {
                                        break 'io Err(RelayError::Transport(e.to_string()));
                                    }
                                }
                                Ok(reply) => inner.handle_reply(reply),
                                Err(e) => warn!(error = %e, "Failed to parse frame"),
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection closed by server");
                        break 'io Err(RelayError::Connection("Connection closed".into()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break 'io Err(RelayError::Transport(e.to_string())),
                }
            }

            _ = &mut shutdown_rx => break 'io Ok(()),
        }
    };

    if result.is_ok() {
        // Best-effort close handshake
        let _ = sink.send(Message::Close(None)).await;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedTokens;

    #[async_trait]
    impl TokenSource for FixedTokens {
        async fn connection_token(&self) -> std::result::Result<String, String> {
            Ok("conn-token".to_string())
        }

        async fn subscription_token(&self, channel: &str) -> std::result::Result<String, String> {
            Ok(format!("sub-token-{}", channel))
        }
    }

    fn client(url: &str) -> RelayClient {
        RelayClient::new(ClientConfig::new(url), Arc::new(FixedTokens))
    }

    #[test]
    fn test_client_initial_state() {
        let client = client("ws://localhost:8000/connection/websocket");

        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(client.client_id().is_none());
    }

    #[test]
    fn test_state_receiver() {
        let client = client("ws://localhost:8000/connection/websocket");
        let rx = client.state_receiver();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_subscription_channel() {
        let client = client("ws://localhost:8000/connection/websocket");
        let sub = client.new_subscription("training_logs");
        assert_eq!(sub.channel(), "training_logs");
        assert!(!sub.is_subscribed());
    }

    #[test]
    fn test_parse_replies_batched_frame() {
        let text = "{\"id\":1,\"publish\":{}}\n{\"id\":2,\"publish\":{}}\n";
        let replies: Vec<Reply> = parse_replies(text).collect::<Result<_>>().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, 1);
        assert_eq!(replies[1].id, 2);
    }

    #[test]
    fn test_parse_replies_ping() {
        let replies: Vec<Reply> = parse_replies("{}").collect::<Result<_>>().unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ping());
    }
}
