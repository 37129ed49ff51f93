use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RoomError;
use crate::presence::{UserId, UserRef};
use crate::room::RoomId;

pub const MAX_MESSAGE_CHARS: usize = 2000;
const SYSTEM_SENDER: &str = "System";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room: RoomId,
    /// `None` for system messages, which never belong to a human sender.
    pub sender_id: Option<UserId>,
    pub sender_display_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// Members who should hear about this message through their notification
    /// stream: everyone except the sender, and nobody for system messages.
    pub fn notification_recipients<'a>(&self, members: &'a [UserRef]) -> Vec<&'a UserRef> {
        let Some(sender) = self.sender_id.as_deref() else {
            return Vec::new();
        };

        members.iter().filter(|m| m.user_id != sender).collect()
    }
}

/// Ordered chat log of one room. System notices share the same timeline as
/// user messages so a resync replays one consistent history.
#[derive(Debug, Clone)]
pub struct ChatRelay {
    room: RoomId,
    log: VecDeque<ChatMessage>,
    retention: usize,
}

impl ChatRelay {
    pub fn new(room: RoomId, retention: usize) -> Self {
        ChatRelay {
            room,
            log: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    pub fn send(&mut self, sender: &UserRef, text: &str) -> Result<ChatMessage, RoomError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RoomError::invalid("message text is empty"));
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(RoomError::invalid(format!(
                "message longer than {MAX_MESSAGE_CHARS} characters"
            )));
        }

        Ok(self.append(
            Some(sender.user_id.clone()),
            sender.display_name.clone(),
            text.to_string(),
            MessageKind::User,
        ))
    }

    pub fn system(&mut self, text: impl Into<String>) -> ChatMessage {
        self.append(None, SYSTEM_SENDER.to_string(), text.into(), MessageKind::System)
    }

    /// The newest `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        let skip = self.log.len().saturating_sub(limit);
        self.log.iter().skip(skip).cloned().collect()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.log.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    fn append(
        &mut self,
        sender_id: Option<UserId>,
        sender_display_name: String,
        text: String,
        kind: MessageKind,
    ) -> ChatMessage {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            room: self.room.clone(),
            sender_id,
            sender_display_name,
            text,
            timestamp: Utc::now(),
            kind,
        };

        if self.log.len() == self.retention {
            self.log.pop_front();
        }
        self.log.push_back(message.clone());
        message
    }
}
