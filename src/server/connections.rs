//! Connection state management

use crate::channels::Channel;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// An encoded frame queued for one client
pub type OutboundFrame = String;

/// A connected, authenticated client
pub struct ClientConnection {
    /// Unique connection ID, reported to the client on connect
    pub id: Uuid,
    /// Subject from the connection token
    pub subject: String,
    /// Name the client announced, if any
    pub name: Option<String>,
    /// Channels this connection is subscribed to
    subscriptions: RwLock<HashSet<String>>,
    /// Channel for sending frames to this client
    tx: mpsc::Sender<OutboundFrame>,
}

impl ClientConnection {
    pub fn new(subject: String, name: Option<String>, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            name,
            subscriptions: RwLock::new(HashSet::new()),
            tx,
        }
    }

    /// Add a subscription; false if it already existed
    pub fn subscribe(&self, channel: &Channel) -> bool {
        self.subscriptions.write().insert(channel.as_str().to_string())
    }

    /// Remove a subscription; false if there was none
    pub fn unsubscribe(&self, channel: &Channel) -> bool {
        self.subscriptions.write().remove(channel.as_str())
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.subscriptions.read().contains(channel.as_str())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Queue a reply for this client, waiting for buffer space
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        self.tx.send(frame).await
    }

    /// Queue a push without waiting; slow consumers miss pushes rather than
    /// stalling the publisher
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), mpsc::error::TrySendError<OutboundFrame>> {
        self.tx.try_send(frame)
    }
}

/// Manages all active connections
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<DashMap<Uuid, Arc<ClientConnection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    pub fn add(&self, conn: Arc<ClientConnection>) {
        self.connections.insert(conn.id, conn);
    }

    /// Remove a connection; its subscriptions go with it
    pub fn remove(&self, id: Uuid) {
        self.connections.remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Find all connections subscribed to the given channel
    pub fn find_subscribers(&self, channel: &Channel) -> Vec<Arc<ClientConnection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_subscribed(channel))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get total connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(subject: &str) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(10);
        (
            Arc::new(ClientConnection::new(subject.to_string(), None, tx)),
            rx,
        )
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let (conn, _rx) = conn("42");
        let channel = Channel::parse("training_logs").unwrap();

        assert!(conn.subscribe(&channel));
        assert!(!conn.subscribe(&channel));
        assert!(conn.is_subscribed(&channel));
        assert_eq!(conn.subscription_count(), 1);

        assert!(conn.unsubscribe(&channel));
        assert!(!conn.unsubscribe(&channel));
        assert!(!conn.is_subscribed(&channel));
    }

    #[test]
    fn test_find_subscribers() {
        let manager = ConnectionManager::new();
        let (a, _rx_a) = conn("42");
        let (b, _rx_b) = conn("43");
        manager.add(a.clone());
        manager.add(b.clone());

        let shared = Channel::parse("training_logs").unwrap();
        let run = Channel::scoped("training_logs", "run-1").unwrap();
        a.subscribe(&shared);
        b.subscribe(&run);

        let subs = manager.find_subscribers(&shared);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, a.id);

        manager.remove(a.id);
        assert!(manager.find_subscribers(&shared).is_empty());
        assert!(manager.get(b.id).is_some());
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_try_send_full_buffer() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new("42".to_string(), None, tx);

        assert!(conn.try_send("{}".to_string()).is_ok());
        assert!(conn.try_send("{}".to_string()).is_err());
    }
}
