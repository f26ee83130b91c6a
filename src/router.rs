use std::sync::Arc;

use log::{debug, warn};

use crate::connection::Identity;
use crate::error::ChatError;
use crate::hub::HubHandle;
use crate::messages::{ChatMessage, ClientMessage, ServerMessage, TypingEvent};
use crate::store::ChatStore;

/// Turns decoded inbound events into persisted state and deliveries.
pub struct EventRouter {
    hub: HubHandle,
    store: Arc<dyn ChatStore>,
}

impl EventRouter {
    pub fn new(hub: HubHandle, store: Arc<dyn ChatStore>) -> Self {
        EventRouter { hub, store }
    }

    pub async fn route(&self, sender: &Identity, event: ClientMessage) -> Result<(), ChatError> {
        match event {
            ClientMessage::ChatMessage {
                receiver_id,
                message,
            } => {
                self.chat_message(sender, receiver_id, message).await?;
                Ok(())
            }
            ClientMessage::Typing {
                receiver_id,
                is_typing,
            } => self.typing(sender, receiver_id, is_typing).await,
        }
    }

    /// Persists the message, then delivers it to the receiver and echoes it
    /// to the sender. Nothing is delivered if persistence fails.
    pub async fn chat_message(
        &self,
        sender: &Identity,
        receiver_id: String,
        message: String,
    ) -> Result<ChatMessage, ChatError> {
        if receiver_id.is_empty() {
            return Err(ChatError::MissingReceiver);
        }
        if message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (id, created_at) = self
            .store
            .persist_message(&sender.user_id, &receiver_id, &message)
            .await?;

        if let Err(e) = self
            .store
            .update_last_message(&sender.user_id, &receiver_id, id)
            .await
        {
            warn!(
                "Failed to update last message for {} and {}: {}",
                sender.user_id, receiver_id, e
            );
        }

        let record = ChatMessage {
            id,
            sender_id: sender.user_id.clone(),
            receiver_id,
            message,
            created_at,
            is_read: false,
            sender_name: sender.username.clone(),
        };
        let event = ServerMessage::NewMessage(record.clone());

        let delivered = self.hub.send_to_user(&record.receiver_id, &event).await;
        debug!(
            "Message {} from {} to {} (delivered: {})",
            id, record.sender_id, record.receiver_id, delivered
        );
        if record.receiver_id != record.sender_id {
            self.hub.send_to_user(&record.sender_id, &event).await;
        }

        Ok(record)
    }

    async fn typing(
        &self,
        sender: &Identity,
        receiver_id: String,
        is_typing: bool,
    ) -> Result<(), ChatError> {
        if receiver_id.is_empty() {
            return Err(ChatError::MissingReceiver);
        }

        let event = ServerMessage::Typing(TypingEvent {
            user_id: sender.user_id.clone(),
            username: sender.username.clone(),
            receiver_id: receiver_id.clone(),
            is_typing,
        });
        self.hub.send_to_user(&receiver_id, &event).await;
        Ok(())
    }
}
