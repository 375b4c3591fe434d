//! Channel routing and push fan-out

use crate::channels::Channel;
use crate::server::connections::ConnectionManager;
use std::sync::Arc;
use tracing::debug;

/// Routes pushes to subscribed clients
#[derive(Clone)]
pub struct TopicRouter {
    connections: Arc<ConnectionManager>,
}

impl TopicRouter {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Queue an encoded push for every subscriber of `channel`; returns how
    /// many subscribers accepted it
    pub fn route(&self, channel: &Channel, frame: &str) -> usize {
        let subscribers = self.connections.find_subscribers(channel);

        if subscribers.is_empty() {
            debug!(channel = %channel, "No subscribers for channel");
            return 0;
        }

        debug!(channel = %channel, subscriber_count = subscribers.len(), "Routing push");

        let mut delivered = 0;
        for subscriber in subscribers {
            match subscriber.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // Expected during rapid disconnect
                    debug!(
                        connection_id = %subscriber.id,
                        error = %e,
                        "Failed to queue push (buffer full or disconnected)"
                    );
                }
            }
        }

        delivered
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connections::ClientConnection;
    use tokio::sync::mpsc;

    #[test]
    fn test_route_only_to_subscribers() {
        let manager = Arc::new(ConnectionManager::new());
        let router = TopicRouter::new(manager.clone());
        let channel = Channel::parse("training_logs").unwrap();

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = Arc::new(ClientConnection::new("42".to_string(), None, tx_a));
        let b = Arc::new(ClientConnection::new("42".to_string(), None, tx_b));
        manager.add(a.clone());
        manager.add(b);
        a.subscribe(&channel);

        assert_eq!(router.route(&channel, "frame"), 1);
        assert_eq!(rx_a.try_recv().unwrap(), "frame");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(router.connection_count(), 2);
    }

    #[test]
    fn test_route_skips_closed_subscriber() {
        let manager = Arc::new(ConnectionManager::new());
        let router = TopicRouter::new(manager.clone());
        let channel = Channel::parse("training_logs").unwrap();

        let (tx, rx) = mpsc::channel(4);
        let conn = Arc::new(ClientConnection::new("42".to_string(), None, tx));
        conn.subscribe(&channel);
        manager.add(conn);
        drop(rx);

        assert_eq!(router.route(&channel, "frame"), 0);
    }
}
