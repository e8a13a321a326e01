//! Database layer for the Bazaar chat service using SQLite
//!
//! Persists users, conversations, messages, and device tokens. Unread counters
//! are stored per participant and only ever mutated through atomic SQL
//! arithmetic or a recompute-from-source update — never read-modify-write in
//! process — so concurrent senders and readers cannot lose updates.

use crate::models::{
    Conversation, ConversationSummary, Device, DeviceType, LastMessage, Message, ParticipantState,
    User,
};
use crate::validation::participant_key;
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection to the specified file path
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let pool = if db_path.as_ref().to_str() == Some(":memory:") {
            // An in-memory SQLite database is per-connection state; the pool
            // must not open a second connection or it sees an empty schema.
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .context("Failed to open in-memory SQLite database")?
        } else {
            let options = SqliteConnectOptions::from_str(&format!(
                "sqlite:{}",
                db_path.as_ref().display()
            ))
            .context("Invalid database path")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

            SqlitePoolOptions::new()
                .connect_with(options)
                .await
                .context("Failed to connect to SQLite database")?
        };

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations to create or update schema
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY NOT NULL,
                username TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY NOT NULL,
                participant_key TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                last_sender_id TEXT,
                last_preview TEXT,
                last_message_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create conversations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_participants (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                unread_count INTEGER NOT NULL DEFAULT 0,
                last_read_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations (id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create conversation_participants table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY NOT NULL,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                attachment_url TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations (id) ON DELETE CASCADE,
                FOREIGN KEY (sender_id) REFERENCES users (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                token TEXT PRIMARY KEY NOT NULL,
                device_type TEXT NOT NULL,
                user_id TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                last_used_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create devices table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_username ON users (username)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_participants_user ON conversation_participants (user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_user ON devices (user_id, active)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── User operations ──

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<User> {
        let user_id = Uuid::new_v4();
        let created_at = now_ms();

        sqlx::query("INSERT INTO users (id, username, display_name, created_at) VALUES (?, ?, ?, ?)")
            .bind(user_id.to_string())
            .bind(username)
            .bind(display_name)
            .bind(created_at)
            .execute(&self.pool)
            .await
            .context("Failed to insert user")?;

        Ok(User {
            id: user_id,
            username: username.to_string(),
            display_name: display_name.to_string(),
            created_at,
        })
    }

    pub async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, display_name, created_at FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user by ID")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, display_name, created_at FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user by username")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn username_exists(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    // ── Conversation operations ──

    /// Create a conversation for a canonical (sorted, deduplicated) participant
    /// set, or return the existing one. The UNIQUE participant_key column makes
    /// this idempotent even when two identical requests race: the loser of the
    /// insert re-selects the winner's row.
    pub async fn create_or_get_conversation(&self, sorted_ids: &[Uuid]) -> Result<Conversation> {
        let key = participant_key(sorted_ids);

        if let Some(existing) = self.get_conversation_by_key(&key).await? {
            return Ok(existing);
        }

        let conversation_id = Uuid::new_v4();
        let created_at = now_ms();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, participant_key, created_at) VALUES (?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(&key)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert conversation")?;

        if inserted.rows_affected() > 0 {
            for user_id in sorted_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?, ?)",
                )
                .bind(conversation_id.to_string())
                .bind(user_id.to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to insert conversation participant")?;
            }
        }
        tx.commit().await?;

        self.get_conversation_by_key(&key)
            .await?
            .context("Conversation missing after insert")
    }

    async fn get_conversation_by_key(&self, key: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, participant_key, created_at, last_sender_id, last_preview, last_message_at FROM conversations WHERE participant_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query conversation by participant key")?;

        match row {
            Some(row) => Ok(Some(self.hydrate_conversation(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, participant_key, created_at, last_sender_id, last_preview, last_message_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query conversation")?;

        match row {
            Some(row) => Ok(Some(self.hydrate_conversation(&row).await?)),
            None => Ok(None),
        }
    }

    async fn hydrate_conversation(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
        let id = Uuid::parse_str(&row.get::<String, _>("id"))?;
        let participant_ids = self.participant_ids(id).await?;
        Ok(Conversation {
            id,
            participant_ids,
            created_at: row.get("created_at"),
            last_message: parse_last_message(row)?,
        })
    }

    pub async fn participant_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY user_id",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query conversation participants")?;

        rows.iter()
            .map(|r| Uuid::parse_str(&r.get::<String, _>("user_id")).map_err(Into::into))
            .collect()
    }

    pub async fn participant_states(&self, conversation_id: Uuid) -> Result<Vec<ParticipantState>> {
        let rows = sqlx::query(
            "SELECT user_id, last_read_at FROM conversation_participants WHERE conversation_id = ? ORDER BY user_id",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query participant states")?;

        rows.iter()
            .map(|r| {
                Ok(ParticipantState {
                    user_id: Uuid::parse_str(&r.get::<String, _>("user_id"))?,
                    last_read_at: r.get("last_read_at"),
                })
            })
            .collect()
    }

    /// Conversations containing `user`, newest activity first, each carrying
    /// that user's stored unread counter.
    pub async fn list_user_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.participant_key, c.created_at, c.last_sender_id, c.last_preview, c.last_message_at,
                   cp.unread_count
            FROM conversations c
            JOIN conversation_participants cp ON c.id = cp.conversation_id
            WHERE cp.user_id = ?
            ORDER BY COALESCE(c.last_message_at, c.created_at) DESC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query user conversations")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation = self.hydrate_conversation(&row).await?;
            summaries.push(ConversationSummary {
                conversation,
                unread_count: row.get::<i64, _>("unread_count") as u32,
            });
        }
        Ok(summaries)
    }

    // ── Message operations ──

    /// Persist a message, refresh the conversation's last-message snapshot,
    /// and increment every other participant's unread counter — one
    /// transaction, so two concurrent sends into the same conversation are
    /// both reflected in every counter.
    pub async fn store_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: &str,
        attachment_url: Option<&str>,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body: body.to_string(),
            attachment_url: attachment_url.map(|s| s.to_string()),
            created_at: now_ms(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, body, attachment_url, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(conversation_id.to_string())
        .bind(sender_id.to_string())
        .bind(&message.body)
        .bind(attachment_url)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to store message")?;

        sqlx::query(
            "UPDATE conversations SET last_sender_id = ?, last_preview = ?, last_message_at = ? WHERE id = ?",
        )
        .bind(sender_id.to_string())
        .bind(message.preview())
        .bind(message.created_at)
        .bind(conversation_id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to update conversation snapshot")?;

        sqlx::query(
            "UPDATE conversation_participants SET unread_count = unread_count + 1 WHERE conversation_id = ? AND user_id != ?",
        )
        .bind(conversation_id.to_string())
        .bind(sender_id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to increment unread counters")?;

        tx.commit().await?;
        Ok(message)
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, body, attachment_url, created_at FROM messages WHERE id = ?",
        )
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query message")?;

        row.map(|r| parse_message(&r)).transpose()
    }

    /// A chronological page of messages, optionally bounded by a cursor
    /// message id (everything strictly older than it).
    pub async fn get_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
        before_id: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let query = if let Some(before) = before_id {
            let before_ts: i64 = sqlx::query_scalar("SELECT created_at FROM messages WHERE id = ?")
                .bind(before.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to resolve cursor message")?
                .unwrap_or(0);

            sqlx::query(
                "SELECT id, conversation_id, sender_id, body, attachment_url, created_at FROM messages WHERE conversation_id = ? AND created_at < ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(conversation_id.to_string())
            .bind(before_ts)
            .bind(limit as i64)
        } else {
            sqlx::query(
                "SELECT id, conversation_id, sender_id, body, attachment_url, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(conversation_id.to_string())
            .bind(limit as i64)
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to query conversation messages")?;

        let mut messages: Vec<Message> =
            rows.iter().map(parse_message).collect::<Result<_>>()?;
        messages.reverse(); // chronological order
        Ok(messages)
    }

    // ── Read state ──

    /// Record a read up to `boundary` (ms) and recompute the unread counter
    /// from the message table at that boundary. The boundary only moves
    /// forward; a stale mark-read arriving after a newer one is a no-op, and a
    /// message committed concurrently with this statement is either counted by
    /// the subquery or lands as an increment on top of the recomputed value.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        boundary: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversation_participants
               SET unread_count = (
                       SELECT COUNT(*) FROM messages m
                        WHERE m.conversation_id = ?1 AND m.sender_id != ?2 AND m.created_at > ?3
                   ),
                   last_read_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2 AND last_read_at <= ?3
            "#,
        )
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .bind(boundary)
        .execute(&self.pool)
        .await
        .context("Failed to mark conversation read")?;
        Ok(())
    }

    /// Whether `user_id` has read a message created at `created_at`
    pub async fn has_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        created_at: i64,
    ) -> Result<bool> {
        let last_read_at: Option<i64> = sqlx::query_scalar(
            "SELECT last_read_at FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query read state")?;

        Ok(last_read_at.is_some_and(|t| t >= created_at))
    }

    pub async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT unread_count FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query unread count")?;
        Ok(count.unwrap_or(0) as u32)
    }

    /// Sum of the same per-conversation counters list views read — the badge
    /// count has no separate derivation path.
    pub async fn unread_total(&self, user_id: Uuid) -> Result<u32> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(unread_count), 0) FROM conversation_participants WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum unread counters")?;
        Ok(total as u32)
    }

    // ── Device operations ──

    /// Upsert a device by token. Re-registration refreshes the type and
    /// last-used timestamp, reactivates the token, and claims ownership when a
    /// user is present — it never detaches an existing owner.
    pub async fn upsert_device(
        &self,
        token: &str,
        device_type: DeviceType,
        user_id: Option<Uuid>,
    ) -> Result<Device> {
        let last_used_at = now_ms();

        sqlx::query(
            r#"
            INSERT INTO devices (token, device_type, user_id, active, last_used_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(token) DO UPDATE SET
                device_type = excluded.device_type,
                user_id = COALESCE(excluded.user_id, devices.user_id),
                active = 1,
                last_used_at = excluded.last_used_at
            "#,
        )
        .bind(token)
        .bind(device_type.as_str())
        .bind(user_id.map(|u| u.to_string()))
        .bind(last_used_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert device")?;

        self.get_device(token)
            .await?
            .context("Device missing after upsert")
    }

    pub async fn get_device(&self, token: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT token, device_type, user_id, active, last_used_at FROM devices WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query device")?;

        row.map(|r| parse_device(&r)).transpose()
    }

    /// Idempotent: deactivating an unknown or already-inactive token is a no-op.
    pub async fn deactivate_device(&self, token: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET active = 0 WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .context("Failed to deactivate device")?;
        Ok(())
    }

    pub async fn active_devices_for(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT token, device_type, user_id, active, last_used_at FROM devices WHERE user_id = ? AND active = 1",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query active devices")?;

        rows.iter().map(parse_device).collect()
    }
}

// ── Helpers ──

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parse_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        username: row.get("username"),
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
    })
}

fn parse_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    Ok(Message {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        conversation_id: Uuid::parse_str(&row.get::<String, _>("conversation_id"))?,
        sender_id: Uuid::parse_str(&row.get::<String, _>("sender_id"))?,
        body: row.get("body"),
        attachment_url: row.get("attachment_url"),
        created_at: row.get("created_at"),
    })
}

fn parse_device(row: &sqlx::sqlite::SqliteRow) -> Result<Device> {
    let device_type_str: String = row.get("device_type");
    Ok(Device {
        token: row.get("token"),
        device_type: DeviceType::from_str(&device_type_str)
            .context("Unknown device type in storage")?,
        user_id: row
            .get::<Option<String>, _>("user_id")
            .map(|s| Uuid::parse_str(&s))
            .transpose()?,
        active: row.get::<i64, _>("active") != 0,
        last_used_at: row.get("last_used_at"),
    })
}

fn parse_last_message(row: &sqlx::sqlite::SqliteRow) -> Result<Option<LastMessage>> {
    let sender: Option<String> = row.get("last_sender_id");
    match sender {
        Some(sender_id) => Ok(Some(LastMessage {
            sender_id: Uuid::parse_str(&sender_id)?,
            preview: row.get::<Option<String>, _>("last_preview").unwrap_or_default(),
            sent_at: row.get::<Option<i64>, _>("last_message_at").unwrap_or_default(),
        })),
        None => Ok(None),
    }
}
