//! In-memory presence tracking: user id → set of live connection handles
//!
//! A user may hold several simultaneous connections (tabs, devices). Entries
//! are created when a connection authenticates and removed when it closes or a
//! push to it fails; nothing here is persisted.

use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Outbound frames for one live connection
pub type ConnectionSender = UnboundedSender<String>;

#[derive(Default)]
pub struct PresenceTracker {
    connections: RwLock<HashMap<Uuid, HashMap<Uuid, ConnectionSender>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, user_id: Uuid, connection_id: Uuid, sender: ConnectionSender) {
        self.connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(connection_id, sender);
    }

    pub async fn disconnect(&self, user_id: Uuid, connection_id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(handles) = connections.get_mut(&user_id) {
            handles.remove(&connection_id);
            if handles.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    /// Point-in-time snapshot; the user may disconnect right after this returns.
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.connections
            .read()
            .await
            .get(&user_id)
            .is_some_and(|handles| !handles.is_empty())
    }

    /// Current connection handles with their senders, cloned out so delivery
    /// happens without holding the registry lock.
    pub async fn connections_for(&self, user_id: Uuid) -> Vec<(Uuid, ConnectionSender)> {
        self.connections
            .read()
            .await
            .get(&user_id)
            .map(|handles| handles.iter().map(|(id, tx)| (*id, tx.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_connect_disconnect_lifecycle() {
        let tracker = PresenceTracker::new();
        let user = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(!tracker.is_online(user).await);

        tracker.connect(user, conn, tx).await;
        assert!(tracker.is_online(user).await);
        assert_eq!(tracker.connections_for(user).await.len(), 1);

        tracker.disconnect(user, conn).await;
        assert!(!tracker.is_online(user).await);
        assert_eq!(tracker.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_multiple_connections_per_user() {
        let tracker = PresenceTracker::new();
        let user = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        tracker.connect(user, c1, tx1).await;
        tracker.connect(user, c2, tx2).await;
        assert_eq!(tracker.connections_for(user).await.len(), 2);

        // Dropping one tab leaves the user online
        tracker.disconnect(user, c1).await;
        assert!(tracker.is_online(user).await);

        tracker.disconnect(user, c2).await;
        assert!(!tracker.is_online(user).await);
    }

    #[tokio::test]
    async fn test_concurrent_churn_across_users() {
        let tracker = std::sync::Arc::new(PresenceTracker::new());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let user = Uuid::new_v4();
                let conn = Uuid::new_v4();
                let (tx, _rx) = mpsc::unbounded_channel();
                tracker.connect(user, conn, tx).await;
                assert!(tracker.is_online(user).await);
                tracker.disconnect(user, conn).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(tracker.online_count().await, 0);
    }
}
