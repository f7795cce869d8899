use debate_protocol::{ServerMessage, SubscriptionId};
use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

pub struct ConnectionManager {
    /// Map from connection ID to outbound message channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<ServerMessage>>>,
    /// Push subscriptions opened by each connection
    subscriptions: RwLock<HashMap<Uuid, HashSet<SubscriptionId>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.senders.write().await.insert(connection_id, sender);
        self.subscriptions
            .write()
            .await
            .insert(connection_id, HashSet::new());

        tracing::debug!("Connection {} opened", connection_id);
    }

    /// Forget a connection, returning the subscriptions it still held
    pub async fn remove_connection(&self, connection_id: Uuid) -> Vec<SubscriptionId> {
        self.senders.write().await.remove(&connection_id);
        let subscriptions = self
            .subscriptions
            .write()
            .await
            .remove(&connection_id)
            .unwrap_or_default();

        tracing::debug!(
            "Connection {} closed with {} open subscriptions",
            connection_id,
            subscriptions.len()
        );
        subscriptions.into_iter().collect()
    }

    pub async fn track_subscription(&self, connection_id: Uuid, subscription_id: SubscriptionId) {
        if let Some(subs) = self.subscriptions.write().await.get_mut(&connection_id) {
            subs.insert(subscription_id);
        }
    }

    /// Stop tracking a subscription; false if this connection never opened it
    pub async fn untrack_subscription(
        &self,
        connection_id: Uuid,
        subscription_id: SubscriptionId,
    ) -> bool {
        self.subscriptions
            .write()
            .await
            .get_mut(&connection_id)
            .is_some_and(|subs| subs.remove(&subscription_id))
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: ServerMessage) {
        let senders = self.senders.read().await;

        if let Some(sender) = senders.get(&connection_id) {
            if let Err(e) = sender.send(message) {
                tracing::error!("Failed to send message to {}: {}", connection_id, e);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
