//! Application state and the conversation service operations
//!
//! `AppState` composes the persistent store, the presence tracker, the live
//! transport, and the notification dispatcher. Every operation validates and
//! authorizes synchronously; notification fan-out happens after persistence
//! commits, on the dispatcher task, so a send request never waits on delivery.

use crate::db::{now_ms, Database};
use crate::dispatch::{DispatchConfig, Dispatcher, MessageNotification};
use crate::error::ChatError;
use crate::live::LiveTransport;
use crate::models::{
    AuthToken, Conversation, ConversationDetail, ConversationSummary, Device, DeviceType, Message,
    User, WsServerEvent,
};
use crate::presence::PresenceTracker;
use crate::push::{MockPushGateway, PushGateway};
use crate::validation::{canonical_participants, validate_message_body, validate_push_token};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

const TOKEN_TTL_SECS: i64 = 86_400;

/// Application state shared across handlers
pub struct AppState {
    /// Database connection for persistent storage
    pub db: Database,
    /// Live connection registry (user id → connection handles)
    pub presence: Arc<PresenceTracker>,
    /// Real-time push channel over the registered connections
    pub live: Arc<LiveTransport>,
    /// Active authentication tokens (in-memory)
    auth_tokens: RwLock<HashMap<String, AuthToken>>,
    /// Publishes message-created events to the dispatcher
    notify_tx: mpsc::UnboundedSender<MessageNotification>,
    /// Server start time (epoch seconds)
    start_time: i64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db", &"<Database>")
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    /// Create application state backed by the given database path, wiring the
    /// dispatcher worker onto the runtime.
    pub async fn new(db_path: &str) -> Result<Arc<Self>> {
        Self::with_gateway(db_path, Arc::new(MockPushGateway::new()), DispatchConfig::default())
            .await
    }

    pub async fn with_gateway(
        db_path: &str,
        gateway: Arc<dyn PushGateway>,
        config: DispatchConfig,
    ) -> Result<Arc<Self>> {
        let db = Database::new(db_path).await?;
        let presence = Arc::new(PresenceTracker::new());
        let live = Arc::new(LiveTransport::new(presence.clone()));

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), live.clone(), gateway, config));
        tokio::spawn(dispatcher.run(notify_rx));

        Ok(Arc::new(Self {
            db,
            presence,
            live,
            auth_tokens: RwLock::new(HashMap::new()),
            notify_tx,
            start_time: now_secs(),
        }))
    }

    /// In-memory state for testing
    pub async fn new_in_memory() -> Result<Arc<Self>> {
        Self::new(":memory:").await
    }

    pub async fn in_memory_with_gateway(
        gateway: Arc<dyn PushGateway>,
        config: DispatchConfig,
    ) -> Result<Arc<Self>> {
        Self::with_gateway(":memory:", gateway, config).await
    }

    pub fn uptime(&self) -> u64 {
        (now_secs() - self.start_time).max(0) as u64
    }

    // ── User directory & auth (consumed interfaces, backed by the store) ──

    pub async fn register_user(&self, username: String, display_name: String) -> Result<User, String> {
        match self.db.username_exists(&username).await {
            Ok(true) => return Err("Username already exists".to_string()),
            Err(e) => return Err(format!("Database error: {}", e)),
            _ => {}
        }
        self.db
            .create_user(&username, &display_name)
            .await
            .map_err(|e| format!("Failed to create user: {}", e))
    }

    pub async fn authenticate_user(&self, username: String) -> Result<AuthToken, String> {
        let user = match self.db.get_user_by_username(&username).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err("User not found".to_string()),
            Err(e) => return Err(format!("Database error: {}", e)),
        };

        let token = format!("tok_{}", Uuid::new_v4().simple());
        let auth_token = AuthToken {
            token: token.clone(),
            user_id: user.id,
            expires_at: now_secs() + TOKEN_TTL_SECS,
        };

        self.auth_tokens.write().await.insert(token, auth_token.clone());
        Ok(auth_token)
    }

    pub async fn validate_token(&self, token: &str) -> Option<Uuid> {
        let auth_tokens = self.auth_tokens.read().await;
        let auth_token = auth_tokens.get(token)?;
        if auth_token.expires_at > now_secs() {
            Some(auth_token.user_id)
        } else {
            None
        }
    }

    pub async fn resolve_user(&self, user_id: Uuid) -> Result<Option<User>, ChatError> {
        Ok(self.db.get_user_by_id(user_id).await?)
    }

    // ── Conversation service operations ──

    /// Start (or return the existing) conversation for a participant set.
    /// The set must contain the initiator, at least two distinct ids, and
    /// every id must resolve in the user directory.
    pub async fn start_conversation(
        &self,
        initiator: Uuid,
        participant_ids: &[Uuid],
    ) -> Result<Conversation, ChatError> {
        let sorted = canonical_participants(initiator, participant_ids)?;
        for id in &sorted {
            if self.resolve_user(*id).await?.is_none() {
                return Err(ChatError::InvalidParticipants(format!("unknown user {id}")));
            }
        }

        Ok(self.db.create_or_get_conversation(&sorted).await?)
    }

    pub async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>, ChatError> {
        Ok(self.db.list_user_conversations(user_id).await?)
    }

    pub async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<ConversationDetail, ChatError> {
        let conversation = self.authorized_conversation(user_id, conversation_id).await?;
        let participants = self.db.participant_states(conversation_id).await?;
        let unread_count = self.db.unread_count(conversation_id, user_id).await?;
        Ok(ConversationDetail { conversation, participants, unread_count })
    }

    pub async fn get_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        limit: u32,
        before: Option<Uuid>,
    ) -> Result<Vec<Message>, ChatError> {
        self.authorized_conversation(user_id, conversation_id).await?;
        Ok(self.db.get_messages(conversation_id, limit, before).await?)
    }

    /// Persist a message, then hand delivery to the dispatcher. Returns as
    /// soon as the message and counter updates are committed.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        body: &str,
        attachment_url: Option<&str>,
    ) -> Result<Message, ChatError> {
        let conversation = self.authorized_conversation(sender_id, conversation_id).await?;
        validate_message_body(body)?;

        let message = self
            .db
            .store_message(conversation_id, sender_id, body, attachment_url)
            .await?;

        let sender_name = self
            .resolve_user(sender_id)
            .await?
            .map(|u| u.display_name)
            .unwrap_or_default();
        let recipients: Vec<Uuid> = conversation
            .participant_ids
            .iter()
            .copied()
            .filter(|id| *id != sender_id)
            .collect();

        let notification = MessageNotification {
            message: message.clone(),
            recipients,
            sender_name,
        };
        if self.notify_tx.send(notification).is_err() {
            warn!("dispatcher channel closed; message {} persisted without fan-out", message.id);
        }

        Ok(message)
    }

    /// Mark the conversation read for `user_id` up to the given message, or up
    /// to now when no boundary is given. Emits best-effort read receipts to
    /// the other participants' live connections.
    pub async fn mark_read(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        up_to_message_id: Option<Uuid>,
    ) -> Result<(), ChatError> {
        let conversation = self.authorized_conversation(user_id, conversation_id).await?;

        let boundary = match up_to_message_id {
            Some(message_id) => {
                let message = self
                    .db
                    .get_message(message_id)
                    .await?
                    .filter(|m| m.conversation_id == conversation_id)
                    .ok_or(ChatError::NotFound("message"))?;
                message.created_at
            }
            None => now_ms(),
        };

        self.db.mark_read(conversation_id, user_id, boundary).await?;

        let receipt = WsServerEvent::ReadReceipt {
            conversation_id,
            reader_id: user_id,
            read_at: boundary,
        };
        for participant in conversation.participant_ids.iter().copied() {
            if participant != user_id {
                self.live.push_to_user(participant, &receipt).await;
            }
        }
        Ok(())
    }

    /// Aggregate unread badge count — the sum of the same per-conversation
    /// counters `list_conversations` reports.
    pub async fn unread_total(&self, user_id: Uuid) -> Result<u32, ChatError> {
        Ok(self.db.unread_total(user_id).await?)
    }

    // ── Device registry ──

    pub async fn register_device(
        &self,
        user_id: Option<Uuid>,
        token: &str,
        device_type: DeviceType,
    ) -> Result<Device, ChatError> {
        validate_push_token(token)?;
        Ok(self.db.upsert_device(token.trim(), device_type, user_id).await?)
    }

    // ── Internal ──

    /// NotFound when the conversation does not exist, NotAuthorized when the
    /// caller is not a participant.
    async fn authorized_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or(ChatError::NotFound("conversation"))?;
        if !conversation.participant_ids.contains(&user_id) {
            return Err(ChatError::NotAuthorized);
        }
        Ok(conversation)
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Shared application state type
pub type SharedState = Arc<AppState>;
