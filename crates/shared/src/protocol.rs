use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUser {
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// Copy of the quoted message taken when the reply was composed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySnapshot {
    pub id: MessageId,
    pub content: String,
    pub sender_name: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
    #[serde(default)]
    pub reactions: BTreeMap<String, Vec<ReactionUser>>,
    #[serde(default)]
    pub read_receipts: Vec<ReadReceipt>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn has_reaction(&self, emoji: &str, user_id: &UserId) -> bool {
        self.reactions
            .get(emoji)
            .is_some_and(|users| users.iter().any(|user| &user.user_id == user_id))
    }

    pub fn is_read_by(&self, user_id: &UserId) -> bool {
        self.read_receipts
            .iter()
            .any(|receipt| &receipt.user_id == user_id)
    }

    /// One-line text shown in conversation lists and notifications.
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text => self.content.clone(),
            MessageKind::Image => "[image]".to_string(),
            MessageKind::Gif => "[gif]".to_string(),
            MessageKind::File => self
                .file_name
                .as_ref()
                .map(|name| format!("[file] {name}"))
                .unwrap_or_else(|| "[file]".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
}

/// Conversation as returned by the backing store. Absent optional fields mean
/// "unknown", not "reset".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

/// Events published on a conversation-scoped channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ConversationEvent {
    NewMessage {
        message: Message,
    },
    ReactionAdded {
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
        user_name: String,
    },
    ReactionRemoved {
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
    },
    TypingStart {
        user_id: UserId,
        user_name: String,
    },
    TypingStop {
        user_id: UserId,
    },
    MessageRead {
        message_id: MessageId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    },
}

/// Events published on a user-scoped channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum UserNotice {
    ConversationCreated {
        conversation: ConversationRecord,
    },
    PresenceChanged {
        user_id: UserId,
        is_online: bool,
    },
    IncomingCall {
        call_id: String,
        conversation_id: ConversationId,
        caller_id: UserId,
        caller_name: String,
        #[serde(default)]
        video: bool,
    },
    MessageNotice {
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: String,
        preview: String,
        created_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetReactionRequest {
    pub message_id: MessageId,
    pub emoji: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSearchResult {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}
