//! Notification dispatcher: decides, per recipient of a new message, between
//! live delivery and device push, with retry and read-state dedup.
//!
//! The request path publishes a `MessageNotification` on an mpsc channel the
//! moment persistence commits; everything here runs after the sender's request
//! has already been answered. Delivery failures are logged and resolved
//! locally — they are never surfaced to the sender, because the persisted
//! conversation state (not the transport) is authoritative.

use crate::db::Database;
use crate::live::LiveTransport;
use crate::models::{Message, WsServerEvent};
use crate::push::{PushEvent, PushGateway, PushOutcome, PushPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event published by the conversation service after a message commits
#[derive(Debug, Clone)]
pub struct MessageNotification {
    pub message: Message,
    /// Every participant except the sender
    pub recipients: Vec<Uuid>,
    pub sender_name: String,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Total attempts per device token, including the first
    pub max_attempts: u32,
    /// First retry delay; doubles per subsequent retry
    pub backoff_base: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

pub struct Dispatcher {
    db: Database,
    live: Arc<LiveTransport>,
    gateway: Arc<dyn PushGateway>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        live: Arc<LiveTransport>,
        gateway: Arc<dyn PushGateway>,
        config: DispatchConfig,
    ) -> Self {
        Self { db, live, gateway, config }
    }

    /// Consume notifications until the service shuts down. Each event is
    /// handled in its own task so a slow fan-out never delays the next one.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<MessageNotification>) {
        info!("notification dispatcher started");
        while let Some(event) = rx.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(event).await;
            });
        }
        info!("notification dispatcher stopped");
    }

    /// Fan one message out to all recipients. Recipients are independent: one
    /// recipient's failure cannot block or fail another's delivery.
    pub async fn dispatch(self: &Arc<Self>, event: MessageNotification) {
        let mut tasks = Vec::with_capacity(event.recipients.len());
        for recipient in event.recipients.iter().copied() {
            let dispatcher = self.clone();
            let message = event.message.clone();
            let sender_name = event.sender_name.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.notify_recipient(recipient, message, sender_name).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn notify_recipient(self: &Arc<Self>, recipient: Uuid, message: Message, sender_name: String) {
        // Step 1: live delivery to every connection the recipient holds.
        // Best-effort; the unread counter, not the transport ack, is the
        // authoritative record.
        let live_event = WsServerEvent::Message { message: message.clone() };
        let reached = self.live.push_to_user(recipient, &live_event).await;
        if reached > 0 {
            debug!("live-delivered message {} to {} connection(s) of {recipient}", message.id, reached);
        }

        // Step 2: device push regardless of live delivery (the user may be
        // online in one tab and asleep on a phone) — unless the message was
        // read in the meantime, checked immediately before dispatch.
        match self.db.has_read(message.conversation_id, recipient, message.created_at).await {
            Ok(true) => {
                debug!("message {} already read by {recipient}; skipping device push", message.id);
                return;
            }
            Ok(false) => {}
            Err(err) => {
                warn!("read-state check failed for {recipient}: {err:#}; skipping device push");
                return;
            }
        }

        let devices = match self.db.active_devices_for(recipient).await {
            Ok(devices) => devices,
            Err(err) => {
                warn!("device lookup failed for {recipient}: {err:#}");
                return;
            }
        };
        if devices.is_empty() {
            debug!("no active devices for {recipient}");
            return;
        }

        let payload = PushPayload {
            event: PushEvent::NewMessage,
            conversation_id: message.conversation_id,
            message_id: message.id,
            sender_name,
            preview: message.preview(),
        };

        // Step 3: each device attempted independently; a poisoned token must
        // not affect the user's other devices.
        let mut tasks = Vec::with_capacity(devices.len());
        for device in devices {
            let dispatcher = self.clone();
            let payload = payload.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.push_device(&device.token, &payload).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// One device push attempt cycle:
    /// `Pending → Sent | Retrying → (Sent | PermanentlyFailed)`, with an
    /// invalid-token report short-circuiting into device deactivation.
    async fn push_device(&self, token: &str, payload: &PushPayload) {
        let mut backoff = self.config.backoff_base;
        for attempt in 1..=self.config.max_attempts {
            match self.gateway.send(token, payload).await {
                PushOutcome::Sent => {
                    debug!(
                        "push sent via {} to token {token} (attempt {attempt})",
                        self.gateway.name()
                    );
                    return;
                }
                PushOutcome::InvalidToken => {
                    warn!("gateway rejected token {token} as invalid; deactivating device");
                    if let Err(err) = self.db.deactivate_device(token).await {
                        warn!("failed to deactivate device {token}: {err:#}");
                    }
                    return;
                }
                PushOutcome::Transient(reason) => {
                    if attempt == self.config.max_attempts {
                        warn!(
                            "push to {token} dropped after {attempt} attempts: {reason}",
                        );
                        return;
                    }
                    debug!("push to {token} failed transiently ({reason}); retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_ms;
    use crate::models::DeviceType;
    use crate::presence::PresenceTracker;
    use crate::push::MockPushGateway;
    use crate::validation::canonical_participants;

    struct Fixture {
        db: Database,
        presence: Arc<PresenceTracker>,
        gateway: Arc<MockPushGateway>,
        dispatcher: Arc<Dispatcher>,
        sender: Uuid,
        recipient: Uuid,
        conversation: Uuid,
    }

    async fn fixture() -> Fixture {
        let db = Database::new(":memory:").await.unwrap();
        let presence = Arc::new(PresenceTracker::new());
        let live = Arc::new(LiveTransport::new(presence.clone()));
        let gateway = Arc::new(MockPushGateway::new());
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            live,
            gateway.clone(),
            DispatchConfig {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        ));

        let sender = db.create_user("seller", "Seller").await.unwrap().id;
        let recipient = db.create_user("buyer", "Buyer").await.unwrap().id;
        let conversation = db
            .create_or_get_conversation(&canonical_participants(sender, &[recipient]).unwrap())
            .await
            .unwrap()
            .id;

        Fixture { db, presence, gateway, dispatcher, sender, recipient, conversation }
    }

    async fn send(f: &Fixture, body: &str) -> MessageNotification {
        let message = f.db.store_message(f.conversation, f.sender, body, None).await.unwrap();
        MessageNotification {
            message,
            recipients: vec![f.recipient],
            sender_name: "Seller".into(),
        }
    }

    #[tokio::test]
    async fn test_online_recipient_gets_live_event_and_device_push() {
        let f = fixture().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        f.presence.connect(f.recipient, Uuid::new_v4(), tx).await;
        f.db.upsert_device("phone-tok", DeviceType::Ios, Some(f.recipient)).await.unwrap();

        f.dispatcher.dispatch(send(&f, "your order shipped").await).await;

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("your order shipped"));
        // Live delivery does not suppress the device push
        assert_eq!(f.gateway.sent_tokens().await, vec!["phone-tok".to_string()]);
    }

    #[tokio::test]
    async fn test_read_before_push_suppresses_device_push() {
        let f = fixture().await;
        f.db.upsert_device("phone-tok", DeviceType::Ios, Some(f.recipient)).await.unwrap();

        let event = send(&f, "quick question").await;
        // Recipient reads the conversation before the dispatcher runs
        f.db.mark_read(f.conversation, f.recipient, now_ms()).await.unwrap();

        f.dispatcher.dispatch(event).await;
        assert!(f.gateway.sent_tokens().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_deactivated_without_affecting_others() {
        let f = fixture().await;
        f.db.upsert_device("dead-tok", DeviceType::Android, Some(f.recipient)).await.unwrap();
        f.db.upsert_device("good-tok", DeviceType::Ios, Some(f.recipient)).await.unwrap();
        f.gateway.mark_invalid("dead-tok").await;

        f.dispatcher.dispatch(send(&f, "offline delivery").await).await;

        assert_eq!(f.gateway.sent_tokens().await, vec!["good-tok".to_string()]);
        let remaining = f.db.active_devices_for(f.recipient).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].token, "good-tok");
    }

    #[tokio::test]
    async fn test_transient_failures_retried_until_success() {
        let f = fixture().await;
        f.db.upsert_device("flaky-tok", DeviceType::Web, Some(f.recipient)).await.unwrap();
        f.gateway.fail_transiently("flaky-tok", 2).await;

        f.dispatcher.dispatch(send(&f, "retry me").await).await;
        assert_eq!(f.gateway.sent_tokens().await, vec!["flaky-tok".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_the_push() {
        let f = fixture().await;
        f.db.upsert_device("down-tok", DeviceType::Web, Some(f.recipient)).await.unwrap();
        // More failures than the attempt budget
        f.gateway.fail_transiently("down-tok", 10).await;

        f.dispatcher.dispatch(send(&f, "dropped alert").await).await;

        assert!(f.gateway.sent_tokens().await.is_empty());
        // The device stays active: only an explicit invalid-token report deactivates
        assert_eq!(f.db.active_devices_for(f.recipient).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recipients_are_isolated() {
        let f = fixture().await;
        let third = f.db.create_user("courier", "Courier").await.unwrap().id;
        let conversation = f
            .db
            .create_or_get_conversation(
                &canonical_participants(f.sender, &[f.recipient, third]).unwrap(),
            )
            .await
            .unwrap()
            .id;

        f.db.upsert_device("buyer-tok", DeviceType::Ios, Some(f.recipient)).await.unwrap();
        f.db.upsert_device("courier-tok", DeviceType::Android, Some(third)).await.unwrap();
        f.gateway.mark_invalid("buyer-tok").await;

        let message = f.db.store_message(conversation, f.sender, "group update", None).await.unwrap();
        f.dispatcher
            .dispatch(MessageNotification {
                message,
                recipients: vec![f.recipient, third],
                sender_name: "Seller".into(),
            })
            .await;

        // The poisoned token failed but the other recipient's push went out
        assert_eq!(f.gateway.sent_tokens().await, vec!["courier-tok".to_string()]);
    }
}
