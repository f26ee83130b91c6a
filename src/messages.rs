use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Events a client may send. Any `user_id` or `chat_id` the client puts on
/// the envelope is ignored; the sender is always the connection's own user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "chat_message")]
    ChatMessage {
        receiver_id: String,
        message: String,
    },
    #[serde(rename = "typing")]
    Typing {
        receiver_id: String,
        is_typing: bool,
    },
}

impl ClientMessage {
    pub fn decode(frame: &str) -> Result<Self, ChatError> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// A persisted direct message, as stored and as delivered in `new_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub sender_name: String,
}

/// One row of a user's inbox: another user, their presence, and the latest
/// message exchanged with them if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatUser {
    pub id: String,
    pub username: String,
    pub is_online: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

/// A currently connected user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub user_id: String,
    pub username: String,
    pub receiver_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatus {
    pub user_id: String,
    pub username: String,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "new_message")]
    NewMessage(ChatMessage),
    #[serde(rename = "typing")]
    Typing(TypingEvent),
    #[serde(rename = "user_status")]
    UserStatus(UserStatus),
    #[serde(rename = "force_refresh")]
    ForceRefresh { timestamp: DateTime<Utc> },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
