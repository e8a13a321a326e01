//! Data models for the Bazaar chat service

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of the denormalized last-message preview
pub const PREVIEW_MAX_CHARS: usize = 160;

/// A user known to the marketplace directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub created_at: i64,
}

/// Authentication token handed out by /auth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: i64,
}

/// A durable thread between a fixed set of participants.
///
/// The participant set is immutable after creation; `participant_key` (the
/// sorted, joined participant ids) is unique in storage so repeated creation
/// for the same set always resolves to the same conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_ids: Vec<Uuid>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
}

/// Denormalized snapshot of the newest message, for list views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub sender_id: Uuid,
    pub preview: String,
    pub sent_at: i64,
}

/// One conversation in a user's list view, carrying that user's unread count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: u32,
}

/// Per-participant read state within a conversation.
///
/// A message is read by this participant iff its `created_at` is at or before
/// `last_read_at` (0 = nothing read yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantState {
    pub user_id: Uuid,
    pub last_read_at: i64,
}

/// Conversation detail: the thread plus everyone's read boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participants: Vec<ParticipantState>,
    pub unread_count: u32,
}

/// A message within a conversation. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    /// Milliseconds since the epoch — read boundaries compare against this
    pub created_at: i64,
}

impl Message {
    /// Body truncated for the conversation-list snapshot
    pub fn preview(&self) -> String {
        self.body.chars().take(PREVIEW_MAX_CHARS).collect()
    }
}

/// Platform a push token belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ios,
    Android,
    Web,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Ios => "ios",
            DeviceType::Android => "android",
            DeviceType::Web => "web",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ios" => Some(DeviceType::Ios),
            "android" => Some(DeviceType::Android),
            "web" => Some(DeviceType::Web),
            _ => None,
        }
    }
}

/// A registered push-delivery endpoint.
///
/// `user_id` is nullable: installs may register a token before the user logs
/// in, and the token is claimed on re-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub token: String,
    pub device_type: DeviceType,
    pub user_id: Option<Uuid>,
    pub active: bool,
    pub last_used_at: i64,
}

// ── HTTP request/response DTOs ──

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct StartConversationRequest {
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default)]
    pub attachment_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    #[serde(default)]
    pub up_to_message_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub token: String,
    pub device_type: DeviceType,
}

#[derive(Debug, Serialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub unread: u32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Error envelope returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

// ── WebSocket wire types ──

/// Commands a connected client may issue over the live channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    SendMessage {
        conversation_id: Uuid,
        body: String,
        #[serde(default)]
        attachment_url: Option<String>,
    },
    MarkRead {
        conversation_id: Uuid,
        #[serde(default)]
        up_to_message_id: Option<Uuid>,
    },
    Ping,
}

/// Events the server pushes to connected clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerEvent {
    Message { message: Message },
    ReadReceipt {
        conversation_id: Uuid,
        reader_id: Uuid,
        read_at: i64,
    },
    Pong { timestamp: i64 },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_preview_truncates() {
        let msg = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            body: "x".repeat(500),
            attachment_url: None,
            created_at: 0,
        };
        assert_eq!(msg.preview().chars().count(), PREVIEW_MAX_CHARS);

        let short = Message { body: "hello".into(), ..msg };
        assert_eq!(short.preview(), "hello");
    }

    #[test]
    fn test_device_type_round_trip() {
        for dt in [DeviceType::Ios, DeviceType::Android, DeviceType::Web] {
            assert_eq!(DeviceType::from_str(dt.as_str()), Some(dt));
        }
        assert_eq!(DeviceType::from_str("windows_phone"), None);
    }

    #[test]
    fn test_ws_client_message_parses() {
        let raw = r#"{"type":"mark_read","conversation_id":"6f9fcd63-84f8-43fc-9c48-7b4e853eb112"}"#;
        let parsed: WsClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, WsClientMessage::MarkRead { up_to_message_id: None, .. }));
    }
}
