//! Integration tests for the Bazaar chat service
//!
//! These tests spawn the server in-process and exercise the conversation,
//! unread-count, and notification-delivery flows end to end.

use axum::{
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsFrame};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use bazaar_chat::{
    dispatch::DispatchConfig,
    handlers::{
        auth_handler, get_conversation_handler, get_messages_handler, health_handler,
        list_conversations_handler, mark_read_handler, register_device_handler, register_handler,
        send_message_handler, start_conversation_handler, unread_count_handler, ws_handler,
    },
    push::MockPushGateway,
    state::{AppState, SharedState},
};

/// Test server instance
struct TestServer {
    base_url: String,
    client: Client,
    state: SharedState,
    gateway: Arc<MockPushGateway>,
}

impl TestServer {
    /// Start a new test server on a random port
    async fn new() -> Self {
        let gateway = Arc::new(MockPushGateway::new());
        let state: SharedState = AppState::in_memory_with_gateway(
            gateway.clone(),
            DispatchConfig {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        )
        .await
        .unwrap();

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/register", post(register_handler))
            .route("/auth", post(auth_handler))
            .route(
                "/conversations",
                post(start_conversation_handler).get(list_conversations_handler),
            )
            .route("/conversations/:id", get(get_conversation_handler))
            .route(
                "/conversations/:id/messages",
                get(get_messages_handler).post(send_message_handler),
            )
            .route("/conversations/:id/read", post(mark_read_handler))
            .route("/unread", get(unread_count_handler))
            .route("/devices", post(register_device_handler))
            .route("/ws", get(ws_handler))
            .with_state(state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(
                        CorsLayer::new()
                            .allow_methods(Any)
                            .allow_headers(Any)
                            .allow_origin(Any),
                    ),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            base_url,
            client: Client::new(),
            state,
            gateway,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ws_url(&self, token: &str) -> String {
        format!(
            "ws://{}/ws?token={}",
            self.base_url.replace("http://", ""),
            token
        )
    }

    /// Register a user and return (user_id, auth token)
    async fn register_and_auth(&self, username: &str) -> (Uuid, String) {
        let response = self
            .client
            .post(self.url("/register"))
            .json(&json!({ "username": username }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "registration failed for {username}");
        let body: Value = response.json().await.unwrap();
        let user_id = Uuid::parse_str(body["user_id"].as_str().unwrap()).unwrap();

        let response = self
            .client
            .post(self.url("/auth"))
            .json(&json!({ "username": username }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "auth failed for {username}");
        let body: Value = response.json().await.unwrap();
        (user_id, body["token"].as_str().unwrap().to_string())
    }

    async fn start_conversation(&self, token: &str, participants: &[Uuid]) -> Uuid {
        let response = self
            .client
            .post(self.url(&format!("/conversations?token={token}")))
            .json(&json!({ "participant_ids": participants }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        Uuid::parse_str(body["conversation"]["id"].as_str().unwrap()).unwrap()
    }

    async fn send_message(&self, token: &str, conversation: Uuid, body_text: &str) -> Value {
        let response = self
            .client
            .post(self.url(&format!("/conversations/{conversation}/messages?token={token}")))
            .json(&json!({ "body": body_text }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    async fn unread(&self, token: &str) -> u64 {
        let response = self
            .client
            .get(self.url(&format!("/unread?token={token}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        body["unread"].as_u64().unwrap()
    }

    async fn mark_read(&self, token: &str, conversation: Uuid) {
        let response = self
            .client
            .post(self.url(&format!("/conversations/{conversation}/read?token={token}")))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    async fn register_device(&self, token: Option<&str>, push_token: &str) {
        let path = match token {
            Some(t) => format!("/devices?token={t}"),
            None => "/devices".to_string(),
        };
        let response = self
            .client
            .post(self.url(&path))
            .json(&json!({ "token": push_token, "device_type": "android" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
    assert!(body["uptime_seconds"].is_number());
}

#[tokio::test]
async fn test_registration_duplicate_username_conflicts() {
    let server = TestServer::new().await;
    server.register_and_auth("vendor_a").await;

    let response = server
        .client
        .post(server.url("/register"))
        .json(&json!({ "username": "vendor_a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_endpoints_require_authentication() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/conversations")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(server.url("/conversations?token=tok_bogus"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_start_conversation_is_idempotent_across_initiators() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, b_token) = server.register_and_auth("bob").await;

    let c1 = server.start_conversation(&a_token, &[a_id, b_id]).await;
    let c2 = server.start_conversation(&b_token, &[b_id, a_id]).await;
    assert_eq!(c1, c2);
}

#[tokio::test]
async fn test_start_conversation_rejects_bad_participant_sets() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;

    // Fewer than two distinct ids
    let response = server
        .client
        .post(server.url(&format!("/conversations?token={a_token}")))
        .json(&json!({ "participant_ids": [a_id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Unknown participant
    let response = server
        .client
        .post(server.url(&format!("/conversations?token={a_token}")))
        .json(&json!({ "participant_ids": [Uuid::new_v4()] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_non_participant_is_rejected() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, _) = server.register_and_auth("bob").await;
    let (_, eve_token) = server.register_and_auth("eve").await;

    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    let response = server
        .client
        .post(server.url(&format!("/conversations/{conv}/messages?token={eve_token}")))
        .json(&json!({ "body": "let me in" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = server
        .client
        .get(server.url(&format!("/conversations/{conv}?token={eve_token}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, _) = server.register_and_auth("bob").await;
    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    let response = server
        .client
        .post(server.url(&format!("/conversations/{conv}/messages?token={a_token}")))
        .json(&json!({ "body": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unread_counters_across_read_send_interleave() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, b_token) = server.register_and_auth("bob").await;

    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    server.send_message(&a_token, conv, "hi").await;
    assert_eq!(server.unread(&b_token).await, 1);
    assert_eq!(server.unread(&a_token).await, 0);

    server.mark_read(&b_token, conv).await;
    assert_eq!(server.unread(&b_token).await, 0);

    server.send_message(&a_token, conv, "again").await;
    assert_eq!(server.unread(&b_token).await, 1);

    // The list view carries the same counter and the latest snapshot
    let response = server
        .client
        .get(server.url(&format!("/conversations?token={b_token}")))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let conversations = body["conversations"].as_array().unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["unread_count"], 1);
    assert_eq!(conversations[0]["last_message"]["preview"], "again");
}

#[tokio::test]
async fn test_message_history_pagination() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, _) = server.register_and_auth("bob").await;
    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    for i in 0..4 {
        server.send_message(&a_token, conv, &format!("msg {i}")).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let response = server
        .client
        .get(server.url(&format!("/conversations/{conv}/messages?token={a_token}&limit=2")))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["body"], "msg 2");
    assert_eq!(messages[1]["body"], "msg 3");
}

#[tokio::test]
async fn test_online_recipient_receives_live_message() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, b_token) = server.register_and_auth("bob").await;
    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    let (mut ws, _) = connect_async(server.ws_url(&b_token)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.state.presence.is_online(b_id).await);

    server.send_message(&a_token, conv, "live hello").await;

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("no live frame arrived")
        .unwrap()
        .unwrap();
    let text = match frame {
        WsFrame::Text(text) => text,
        other => panic!("unexpected frame: {other:?}"),
    };
    let event: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(event["type"], "message");
    assert_eq!(event["message"]["body"], "live hello");
}

#[tokio::test]
async fn test_read_receipt_reaches_other_participants() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, b_token) = server.register_and_auth("bob").await;
    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    let (mut ws_a, _) = connect_async(server.ws_url(&a_token)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.send_message(&a_token, conv, "seen yet?").await;
    server.mark_read(&b_token, conv).await;

    // Skip frames until the read receipt shows up
    let receipt = loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws_a.next())
            .await
            .expect("no read receipt arrived")
            .unwrap()
            .unwrap();
        if let WsFrame::Text(text) = frame {
            let event: Value = serde_json::from_str(&text).unwrap();
            if event["type"] == "read_receipt" {
                break event;
            }
        }
    };
    assert_eq!(receipt["conversation_id"].as_str().unwrap(), conv.to_string());
    assert_eq!(receipt["reader_id"].as_str().unwrap(), b_id.to_string());
}

#[tokio::test]
async fn test_ws_send_message_updates_recipient_counters() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, b_token) = server.register_and_auth("bob").await;
    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    let (mut ws, _) = connect_async(server.ws_url(&a_token)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    ws.send(WsFrame::Text(
        json!({ "type": "send_message", "conversation_id": conv, "body": "over the socket" })
            .to_string(),
    ))
    .await
    .unwrap();

    // The sending connection gets the persisted message echoed back
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("no echo arrived")
        .unwrap()
        .unwrap();
    if let WsFrame::Text(text) = frame {
        let event: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(event["type"], "message");
        assert_eq!(event["message"]["body"], "over the socket");
    } else {
        panic!("unexpected frame");
    }

    assert_eq!(server.unread(&b_token).await, 1);
}

#[tokio::test]
async fn test_offline_recipient_gets_push_on_each_device() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, b_token) = server.register_and_auth("bob").await;
    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    server.register_device(Some(&b_token), "b-phone").await;
    server.register_device(Some(&b_token), "b-tablet").await;
    server.gateway.mark_invalid("b-phone").await;

    server.send_message(&a_token, conv, "while you were out").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The valid device got its push; the rejected one did not block it
    assert_eq!(server.gateway.sent_tokens().await, vec!["b-tablet".to_string()]);

    // The invalid token was deactivated and is excluded from future fan-out
    let remaining = server.state.db.active_devices_for(b_id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].token, "b-tablet");
}

#[tokio::test]
async fn test_anonymous_device_registration_then_claim() {
    let server = TestServer::new().await;
    let (b_id, b_token) = server.register_and_auth("bob").await;

    // Install registers before login
    server.register_device(None, "fresh-install").await;
    assert!(server.state.db.active_devices_for(b_id).await.unwrap().is_empty());

    // Login re-uploads the same token and claims it; no duplicate appears
    server.register_device(Some(&b_token), "fresh-install").await;
    let devices = server.state.db.active_devices_for(b_id).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].token, "fresh-install");
}

#[tokio::test]
async fn test_disconnect_removes_presence() {
    let server = TestServer::new().await;
    let (b_id, b_token) = server.register_and_auth("bob").await;

    let (ws, _) = connect_async(server.ws_url(&b_token)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.state.presence.is_online(b_id).await);

    drop(ws);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.state.presence.is_online(b_id).await);
}

#[tokio::test]
async fn test_concurrent_sends_from_both_sides() {
    let server = TestServer::new().await;
    let (a_id, a_token) = server.register_and_auth("alice").await;
    let (b_id, b_token) = server.register_and_auth("bob").await;
    let conv = server.start_conversation(&a_token, &[a_id, b_id]).await;

    let mut handles = Vec::new();
    for i in 0..6 {
        let client = server.client.clone();
        let token = if i % 2 == 0 { a_token.clone() } else { b_token.clone() };
        let url = server.url(&format!("/conversations/{conv}/messages?token={token}"));
        handles.push(tokio::spawn(async move {
            let response = client
                .post(&url)
                .json(&json!({ "body": format!("both typing {i}") }))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // Each side sent 3 and received 3 — nothing lost under concurrency
    assert_eq!(server.unread(&a_token).await, 3);
    assert_eq!(server.unread(&b_token).await, 3);
}
