#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use forum_chat::error::StoreError;
use forum_chat::hub::{Hub, HubHandle};
use forum_chat::messages::{ChatMessage, ChatUser, ServerMessage};
use forum_chat::store::ChatStore;

/// In-memory store that records every write in order.
#[derive(Default)]
pub struct RecordingStore {
    pub presence: Mutex<Vec<(String, bool)>>,
    pub messages: Mutex<Vec<ChatMessage>>,
    pub last_message: Mutex<Vec<((String, String), i64)>>,
    pub fail_writes: AtomicBool,
}

impl RecordingStore {
    pub fn presence_log(&self) -> Vec<(String, bool)> {
        self.presence.lock().unwrap().clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn fail(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatStore for RecordingStore {
    async fn persist_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<(i64, DateTime<Utc>), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        let mut messages = self.messages.lock().unwrap();
        let id = i64::try_from(messages.len()).unwrap() + 1;
        let created_at = Utc::now();
        messages.push(ChatMessage {
            id,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            message: body.to_string(),
            created_at,
            is_read: false,
            sender_name: String::new(),
        });
        Ok((id, created_at))
    }

    async fn display_name(&self, user_id: &str) -> Result<String, StoreError> {
        Err(StoreError::UnknownUser(user_id.to_string()))
    }

    async fn set_presence(&self, user_id: &str, is_online: bool) -> Result<(), StoreError> {
        self.presence
            .lock()
            .unwrap()
            .push((user_id.to_string(), is_online));
        Ok(())
    }

    async fn update_last_message(
        &self,
        user_a: &str,
        user_b: &str,
        message_id: i64,
    ) -> Result<(), StoreError> {
        let (a, b) = forum_chat::store::canonical_pair(user_a, user_b);
        self.last_message
            .lock()
            .unwrap()
            .push(((a.to_string(), b.to_string()), message_id));
        Ok(())
    }

    async fn session_user(&self, _token: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn conversation(
        &self,
        _user_id: &str,
        _other_id: &str,
        _page: u32,
        _limit: u32,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(Vec::new())
    }

    async fn mark_read(&self, _receiver_id: &str, _sender_id: &str) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn chat_users(&self, _user_id: &str) -> Result<Vec<ChatUser>, StoreError> {
        Ok(Vec::new())
    }
}

/// Starts a hub without the force_refresh broadcast so tests see only
/// presence and chat traffic.
pub fn start_hub(store: Arc<RecordingStore>) -> HubHandle {
    let (hub, handle) = Hub::new(store, false);
    tokio::spawn(hub.run());
    handle
}

/// Next decoded event, or `None` if nothing arrives shortly.
pub async fn next_event(rx: &mut mpsc::Receiver<String>) -> Option<ServerMessage> {
    match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        Ok(Some(frame)) => Some(serde_json::from_str(&frame).expect("valid outbound frame")),
        _ => None,
    }
}

/// Everything currently queued.
pub fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<ServerMessage> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        events.push(serde_json::from_str(&frame).expect("valid outbound frame"));
    }
    events
}

/// Waits until the sender side of the buffer is gone.
pub async fn closed(rx: &mut mpsc::Receiver<String>) -> bool {
    let wait = async {
        while rx.recv().await.is_some() {}
    };
    tokio::time::timeout(Duration::from_secs(1), wait).await.is_ok()
}
