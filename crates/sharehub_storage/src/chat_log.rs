#![forbid(unsafe_code)]

use sharehub_contracts::chat::{ChatMessage, ChatMessageInput, CHAT_LOG_CAPACITY};
use sharehub_contracts::UnixTimeMs;
use tracing::warn;

use crate::bounded::BoundedStore;

pub const CHAT_MESSAGES_KEY: &str = "chat_messages";

impl BoundedStore {
    /// Appends a message to the local chat log, keeping only the newest
    /// [`CHAT_LOG_CAPACITY`] entries.
    pub fn save_chat_message(&self, input: ChatMessageInput) -> bool {
        let message = match ChatMessage::v1(
            uuid::Uuid::new_v4().to_string(),
            input,
            UnixTimeMs::now(),
        ) {
            Ok(message) => message,
            Err(violation) => {
                warn!(error = %violation, "rejected chat message");
                return false;
            }
        };
        let mut messages = self.chat_messages();
        messages.push(message);
        let overflow = messages.len().saturating_sub(CHAT_LOG_CAPACITY);
        messages.drain(..overflow);
        self.set_item(CHAT_MESSAGES_KEY, &messages)
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.get_item(CHAT_MESSAGES_KEY, Vec::new())
    }

    pub fn clear_chat_messages(&self) -> bool {
        self.remove_item(CHAT_MESSAGES_KEY)
    }
}
