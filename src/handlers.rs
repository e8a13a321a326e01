//! HTTP and WebSocket handlers for the Bazaar chat service

use crate::error::ChatError;
use crate::models::{
    AuthRequest, AuthResponse, ConversationDetail, ConversationsResponse, ErrorResponse,
    HealthResponse, MarkReadRequest, MessagesResponse, RegisterDeviceRequest, RegisterRequest,
    RegisterResponse, SendMessageRequest, StartConversationRequest, UnreadResponse,
    WsClientMessage, WsServerEvent,
};
use crate::state::SharedState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

const DEFAULT_MESSAGE_PAGE: u32 = 50;

/// Health check endpoint
pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime(),
    })
}

/// User registration endpoint (directory stand-in)
pub async fn register_handler(
    State(state): State<SharedState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, Json<ErrorResponse>)> {
    if request.username.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: "Username cannot be empty".into(), code: 400 }),
        ));
    }

    let display_name = request
        .display_name
        .unwrap_or_else(|| request.username.clone());

    match state.register_user(request.username, display_name).await {
        Ok(user) => {
            info!("Registered new user: {}", user.id);
            Ok(Json(RegisterResponse {
                user_id: user.id,
                message: "User registered successfully".into(),
            }))
        }
        Err(err) => Err((StatusCode::CONFLICT, Json(ErrorResponse { error: err, code: 409 }))),
    }
}

/// User authentication endpoint
pub async fn auth_handler(
    State(state): State<SharedState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.authenticate_user(request.username).await {
        Ok(auth_token) => {
            info!("User authenticated: {}", auth_token.user_id);
            Ok(Json(AuthResponse {
                token: auth_token.token,
                user_id: auth_token.user_id,
                expires_at: auth_token.expires_at,
            }))
        }
        Err(err) => Err((StatusCode::UNAUTHORIZED, Json(ErrorResponse { error: err, code: 401 }))),
    }
}

// ── Conversation endpoints ──

/// Start (or fetch the existing) conversation for a participant set
pub async fn start_conversation_handler(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<StartConversationRequest>,
) -> Result<Json<serde_json::Value>, ChatError> {
    let user_id = extract_user_from_token(&state, &params).await?;

    let conversation = state
        .start_conversation(user_id, &request.participant_ids)
        .await?;
    info!("Conversation {} ready for {}", conversation.id, user_id);
    Ok(Json(serde_json::json!({ "conversation": conversation })))
}

/// List the caller's conversations with unread counts
pub async fn list_conversations_handler(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ConversationsResponse>, ChatError> {
    let user_id = extract_user_from_token(&state, &params).await?;
    let conversations = state.list_conversations(user_id).await?;
    Ok(Json(ConversationsResponse { conversations }))
}

/// Fetch one conversation with participant read boundaries
pub async fn get_conversation_handler(
    State(state): State<SharedState>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ConversationDetail>, ChatError> {
    let user_id = extract_user_from_token(&state, &params).await?;
    let detail = state.get_conversation(user_id, conversation_id).await?;
    Ok(Json(detail))
}

/// Fetch a chronological page of messages (?limit=&before=)
pub async fn get_messages_handler(
    State(state): State<SharedState>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<MessagesResponse>, ChatError> {
    let user_id = extract_user_from_token(&state, &params).await?;

    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MESSAGE_PAGE);
    let before = params.get("before").and_then(|v| Uuid::parse_str(v).ok());

    let messages = state
        .get_messages(user_id, conversation_id, limit, before)
        .await?;
    Ok(Json(MessagesResponse { messages }))
}

/// Send a message into a conversation
pub async fn send_message_handler(
    State(state): State<SharedState>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<serde_json::Value>, ChatError> {
    let user_id = extract_user_from_token(&state, &params).await?;

    let message = state
        .send_message(
            user_id,
            conversation_id,
            &request.body,
            request.attachment_url.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "message": message })))
}

/// Mark a conversation read, optionally up to a specific message
pub async fn mark_read_handler(
    State(state): State<SharedState>,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<MarkReadRequest>,
) -> Result<Json<serde_json::Value>, ChatError> {
    let user_id = extract_user_from_token(&state, &params).await?;

    state
        .mark_read(user_id, conversation_id, request.up_to_message_id)
        .await?;
    Ok(Json(serde_json::json!({ "status": "read", "conversation_id": conversation_id })))
}

/// Aggregate unread badge count across all of the caller's conversations
pub async fn unread_count_handler(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<UnreadResponse>, ChatError> {
    let user_id = extract_user_from_token(&state, &params).await?;
    let unread = state.unread_total(user_id).await?;
    Ok(Json(UnreadResponse { unread }))
}

// ── Device endpoints ──

/// Register a device push token. Works without authentication so installs can
/// upload a token before login; an authenticated call claims the token.
pub async fn register_device_handler(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<RegisterDeviceRequest>,
) -> Result<Json<serde_json::Value>, ChatError> {
    let user_id = match params.get("token") {
        Some(token) => state.validate_token(token).await,
        None => None,
    };

    let device = state
        .register_device(user_id, &request.token, request.device_type)
        .await?;
    Ok(Json(serde_json::json!({ "device": device })))
}

/// Helper to extract user_id from token query param
async fn extract_user_from_token(
    state: &SharedState,
    params: &HashMap<String, String>,
) -> Result<Uuid, ChatError> {
    let token = params.get("token").ok_or(ChatError::Unauthenticated)?;
    state
        .validate_token(token)
        .await
        .ok_or(ChatError::Unauthenticated)
}

// ── WebSocket ──

/// WebSocket upgrade handler: authenticates, then registers the connection
/// with the presence tracker for the lifetime of the socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<SharedState>,
) -> Response {
    let token = match params.get("token") {
        Some(token) => token.clone(),
        None => return ChatError::Unauthenticated.into_response(),
    };

    let user_id = match state.validate_token(&token).await {
        Some(uid) => uid,
        None => return ChatError::Unauthenticated.into_response(),
    };

    info!("WebSocket connection established for user: {}", user_id);
    ws.on_upgrade(move |socket| websocket_handler(socket, user_id, state))
}

async fn websocket_handler(socket: WebSocket, user_id: Uuid, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = Uuid::new_v4();

    state.presence.connect(user_id, connection_id, tx.clone()).await;

    let outgoing_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let result = match serde_json::from_str::<WsClientMessage>(&text) {
                    Ok(command) => handle_ws_command(command, user_id, &state)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(format!("invalid message format: {e}")),
                };
                if let Err(err) = result {
                    error!("Error handling WebSocket message: {}", err);
                    let event = WsServerEvent::Error { error: err };
                    if let Ok(frame) = serde_json::to_string(&event) {
                        let _ = tx.send(frame);
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket closed for user: {}", user_id);
                break;
            }
            Ok(Message::Ping(_)) => {
                let pong = WsServerEvent::Pong { timestamp: crate::db::now_ms() };
                if serde_json::to_string(&pong).is_ok_and(|frame| tx.send(frame).is_err()) {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                error!("WebSocket error for user {}: {}", user_id, err);
                break;
            }
        }
    }

    // Deterministic presence teardown on any exit path
    state.presence.disconnect(user_id, connection_id).await;
    outgoing_task.abort();
    info!("WebSocket handler terminated for user: {}", user_id);
}

async fn handle_ws_command(
    command: WsClientMessage,
    sender_user_id: Uuid,
    state: &SharedState,
) -> Result<(), ChatError> {
    match command {
        WsClientMessage::SendMessage { conversation_id, body, attachment_url } => {
            let message = state
                .send_message(sender_user_id, conversation_id, &body, attachment_url.as_deref())
                .await?;
            // Echo the persisted message to the sending connection; recipients
            // are notified by the dispatcher.
            let event = WsServerEvent::Message { message };
            state.live.push_to_user(sender_user_id, &event).await;
        }

        WsClientMessage::MarkRead { conversation_id, up_to_message_id } => {
            state
                .mark_read(sender_user_id, conversation_id, up_to_message_id)
                .await?;
        }

        WsClientMessage::Ping => {
            let pong = WsServerEvent::Pong { timestamp: crate::db::now_ms() };
            state.live.push_to_user(sender_user_id, &pong).await;
        }
    }

    Ok(())
}
