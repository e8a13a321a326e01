//! Push gateway contract and payload for out-of-band device notifications
//!
//! The gateway is an external collaborator; everything behind `PushGateway` is
//! mockable so delivery behavior (invalid tokens, transient failures) can be
//! exercised in tests without a real APNs/FCM round trip.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// The payload delivered to a device token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub event: PushEvent,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub sender_name: String,
    /// Truncated body, for the notification banner
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage,
}

/// Result of a single gateway send attempt
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Accepted by the gateway
    Sent,
    /// Token is permanently invalid — deactivate the device
    InvalidToken,
    /// Temporary gateway/network failure — eligible for retry
    Transient(String),
}

/// External push gateway (APNs, FCM, web push) behind one contract
#[async_trait::async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, token: &str, payload: &PushPayload) -> PushOutcome;

    /// Gateway name for logging
    fn name(&self) -> &'static str;
}

/// In-process gateway used in development and tests.
///
/// Records every accepted send and supports scripting failure behavior per
/// token: permanently invalid tokens and a number of transient failures to
/// serve before succeeding.
#[derive(Default)]
pub struct MockPushGateway {
    pub sent: Arc<Mutex<Vec<(String, PushPayload)>>>,
    invalid_tokens: Mutex<Vec<String>>,
    transient_failures: Mutex<HashMap<String, u32>>,
}

impl MockPushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// All future sends to this token report `InvalidToken`
    pub async fn mark_invalid(&self, token: &str) {
        self.invalid_tokens.lock().await.push(token.to_string());
    }

    /// The next `count` sends to this token fail transiently, then succeed
    pub async fn fail_transiently(&self, token: &str, count: u32) {
        self.transient_failures
            .lock()
            .await
            .insert(token.to_string(), count);
    }

    pub async fn sent_tokens(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait::async_trait]
impl PushGateway for MockPushGateway {
    async fn send(&self, token: &str, payload: &PushPayload) -> PushOutcome {
        if self.invalid_tokens.lock().await.iter().any(|t| t == token) {
            return PushOutcome::InvalidToken;
        }

        {
            let mut failures = self.transient_failures.lock().await;
            if let Some(remaining) = failures.get_mut(token) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return PushOutcome::Transient("simulated gateway timeout".into());
                }
            }
        }

        debug!("mock push: token={token} message={}", payload.message_id);
        self.sent
            .lock()
            .await
            .push((token.to_string(), payload.clone()));
        PushOutcome::Sent
    }

    fn name(&self) -> &'static str {
        "mock-push"
    }
}
