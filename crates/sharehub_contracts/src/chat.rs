#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_text, validate_token};
use crate::{ContractViolation, UnixTimeMs, Validate};

pub const CHAT_LOG_CAPACITY: usize = 100;
pub const CHAT_BODY_MAX_LEN: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessageInput {
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
}

impl Validate for ChatMessageInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("chat_message.conversation_id", &self.conversation_id, 128)?;
        validate_token("chat_message.sender_id", &self.sender_id, 128)?;
        if self.body.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "chat_message.body",
                reason: "must be non-empty",
            });
        }
        if self.body.len() > CHAT_BODY_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "chat_message.body",
                reason: "exceeds max length",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: UnixTimeMs,
}

impl ChatMessage {
    pub fn v1(
        id: String,
        input: ChatMessageInput,
        timestamp_ms: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let message = Self {
            id,
            conversation_id: input.conversation_id,
            sender_id: input.sender_id,
            body: input.body,
            timestamp_ms,
        };
        message.validate()?;
        Ok(message)
    }
}

impl Validate for ChatMessage {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("chat_message.id", &self.id, 64)?;
        ChatMessageInput {
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
        }
        .validate()
    }
}
