//! Persistence contract consumed by the hub and router, and its SQLite backing.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;
use crate::messages::{ChatMessage, ChatUser};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 5;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS sessions (
    user_id TEXT NOT NULL,
    session_token TEXT NOT NULL UNIQUE,
    session_expiry TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_pair
    ON chat_messages (sender_id, receiver_id);
CREATE TABLE IF NOT EXISTS user_online (
    user_id TEXT PRIMARY KEY,
    is_online INTEGER NOT NULL,
    last_activity TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS user_chat_last_message (
    user1_id TEXT NOT NULL,
    user2_id TEXT NOT NULL,
    last_message_id INTEGER NOT NULL,
    PRIMARY KEY (user1_id, user2_id)
);
";

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Appends an unread message and returns its assigned id and timestamp.
    async fn persist_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<(i64, DateTime<Utc>), StoreError>;

    async fn display_name(&self, user_id: &str) -> Result<String, StoreError>;

    async fn set_presence(&self, user_id: &str, is_online: bool) -> Result<(), StoreError>;

    async fn update_last_message(
        &self,
        user_a: &str,
        user_b: &str,
        message_id: i64,
    ) -> Result<(), StoreError>;

    /// Resolves an unexpired session token to its user id.
    async fn session_user(&self, token: &str) -> Result<Option<String>, StoreError>;

    /// One page of the conversation between two users, oldest first.
    /// Page 1 holds the most recent messages.
    async fn conversation(
        &self,
        user_id: &str,
        other_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Flags every unread message from `sender_id` to `receiver_id` as read.
    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64, StoreError>;

    /// Every other user with their presence, the latest message exchanged
    /// with `user_id` and how many of their messages `user_id` has not read.
    /// Users with a conversation come first, most recent first; the rest
    /// follow by name.
    async fn chat_users(&self, user_id: &str) -> Result<Vec<ChatUser>, StoreError>;
}

/// Orders a participant pair so the same conversation always maps to one key.
pub fn canonical_pair<'a>(user_a: &'a str, user_b: &'a str) -> (&'a str, &'a str) {
    if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Database ready at {}", database_url);
        Ok(store)
    }

    /// A private in-memory database. Pinned to a single connection so every
    /// query sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_user(&self, user_id: &str, username: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id, username) VALUES (?, ?)")
            .bind(user_id)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replaces any existing session for the user; one session per user.
    pub async fn create_session(
        &self,
        user_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO sessions (user_id, session_token, session_expiry) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(token)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn persist_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<(i64, DateTime<Utc>), StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            r"
            INSERT INTO chat_messages (sender_id, receiver_id, message, created_at, is_read)
            VALUES (?, ?, ?, ?, 0)
            ",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .bind(body)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Stored message {} from {} to {}", id, sender_id, receiver_id);
        Ok((id, created_at))
    }

    async fn display_name(&self, user_id: &str) -> Result<String, StoreError> {
        sqlx::query_scalar::<_, String>("SELECT username FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::UnknownUser(user_id.to_string()))
    }

    async fn set_presence(&self, user_id: &str, is_online: bool) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO user_online (user_id, is_online, last_activity)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                is_online = excluded.is_online,
                last_activity = excluded.last_activity
            ",
        )
        .bind(user_id)
        .bind(is_online)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_last_message(
        &self,
        user_a: &str,
        user_b: &str,
        message_id: i64,
    ) -> Result<(), StoreError> {
        let (user1, user2) = canonical_pair(user_a, user_b);
        sqlx::query(
            r"
            INSERT INTO user_chat_last_message (user1_id, user2_id, last_message_id)
            VALUES (?, ?, ?)
            ON CONFLICT(user1_id, user2_id) DO UPDATE SET
                last_message_id = excluded.last_message_id
            ",
        )
        .bind(user1)
        .bind(user2)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session_user(&self, token: &str) -> Result<Option<String>, StoreError> {
        let user_id = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM sessions WHERE session_token = ? AND session_expiry > ?",
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    async fn conversation(
        &self,
        user_id: &str,
        other_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let offset = i64::from(page.max(1) - 1) * i64::from(limit);
        let mut messages = sqlx::query_as::<_, ChatMessage>(
            r"
            SELECT cm.id, cm.sender_id, cm.receiver_id, cm.message, cm.created_at, cm.is_read,
                   COALESCE(u.username, 'Unknown') AS sender_name
            FROM chat_messages cm
            LEFT JOIN users u ON u.id = cm.sender_id
            WHERE (cm.sender_id = ? AND cm.receiver_id = ?)
               OR (cm.sender_id = ? AND cm.receiver_id = ?)
            ORDER BY cm.id DESC
            LIMIT ? OFFSET ?
            ",
        )
        .bind(user_id)
        .bind(other_id)
        .bind(other_id)
        .bind(user_id)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        messages.reverse();
        Ok(messages)
    }

    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE chat_messages SET is_read = 1 WHERE receiver_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(receiver_id)
        .bind(sender_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn chat_users(&self, user_id: &str) -> Result<Vec<ChatUser>, StoreError> {
        let users = sqlx::query_as::<_, ChatUser>(
            r"
            SELECT u.id, u.username,
                   COALESCE(uo.is_online, 0) AS is_online,
                   uo.last_activity,
                   cm.message AS last_message,
                   cm.created_at AS last_message_time,
                   (SELECT COUNT(*) FROM chat_messages unread
                     WHERE unread.sender_id = u.id
                       AND unread.receiver_id = ?
                       AND unread.is_read = 0) AS unread_count
            FROM users u
            LEFT JOIN user_online uo ON uo.user_id = u.id
            LEFT JOIN user_chat_last_message lm
                   ON (lm.user1_id = ? AND lm.user2_id = u.id)
                   OR (lm.user2_id = ? AND lm.user1_id = u.id)
            LEFT JOIN chat_messages cm ON cm.id = lm.last_message_id
            WHERE u.id != ?
            ORDER BY cm.id IS NULL, cm.id DESC, u.username
            ",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}
