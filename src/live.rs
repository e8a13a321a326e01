//! Live transport: pushes events to connected clients over their WebSocket
//! connection senders.
//!
//! Delivery is best-effort from the caller's perspective. A send into a closed
//! channel means the socket task has gone away; the stale presence entry is
//! pruned on the spot so no dangling handles accumulate.

use crate::models::WsServerEvent;
use crate::presence::PresenceTracker;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct LiveTransport {
    presence: Arc<PresenceTracker>,
}

impl LiveTransport {
    pub fn new(presence: Arc<PresenceTracker>) -> Self {
        Self { presence }
    }

    /// Push one event to a specific connection handle. Returns false if the
    /// handle is dead (the caller's presence entry has already been pruned).
    pub async fn push_to_connection(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        sender: &crate::presence::ConnectionSender,
        event: &WsServerEvent,
    ) -> bool {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!("failed to serialize live event: {err}");
                return true;
            }
        };
        if sender.send(frame).is_err() {
            debug!("pruning dead connection {connection_id} for user {user_id}");
            self.presence.disconnect(user_id, connection_id).await;
            return false;
        }
        true
    }

    /// Fan an event out to every live connection a user holds, pruning any
    /// that turn out to be dead. Returns the number of handles reached.
    pub async fn push_to_user(&self, user_id: Uuid, event: &WsServerEvent) -> usize {
        let mut delivered = 0;
        for (connection_id, sender) in self.presence.connections_for(user_id).await {
            if self
                .push_to_connection(user_id, connection_id, &sender, event)
                .await
            {
                delivered += 1;
            }
        }
        delivered
    }
}
