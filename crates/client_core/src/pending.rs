//! Optimistic-now, reconciled-later bookkeeping. The only place temporary
//! message ids are minted or resolved.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageKind, UserId, TEMP_ID_PREFIX},
    protocol::{CreateMessageRequest, Message, ReplySnapshot},
};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{MessageLedger, Settlement};

/// Temporary identity of an optimistic effect. Send operations reuse it as
/// the placeholder message id.
pub type LocalId = MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    SendMessage,
    SendGif,
    ToggleReaction,
    MarkRead,
}

impl OperationKind {
    pub fn is_send(self) -> bool {
        matches!(self, Self::SendMessage | Self::SendGif)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InFlight,
    Committed,
}

/// What the user typed into the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub reply_to: Option<ReplySnapshot>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            file_url: None,
            file_name: None,
            reply_to: None,
        }
    }

    pub fn gif(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            kind: MessageKind::Gif,
            content: url.clone(),
            file_url: Some(url),
            file_name: None,
            reply_to: None,
        }
    }

    pub fn with_reply(mut self, reply_to: ReplySnapshot) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn to_request(&self, conversation_id: &ConversationId) -> CreateMessageRequest {
        CreateMessageRequest {
            conversation_id: conversation_id.clone(),
            kind: self.kind,
            content: self.content.clone(),
            file_url: self.file_url.clone(),
            file_name: self.file_name.clone(),
            reply_to_id: self.reply_to.as_ref().map(|reply| reply.id.clone()),
        }
    }

    /// Placeholder ledger entry, keyed by client clock time.
    pub fn optimistic(
        &self,
        local_id: &LocalId,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        sender_name: &str,
        now: DateTime<Utc>,
    ) -> Message {
        Message {
            id: local_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            sender_name: Some(sender_name.to_string()),
            kind: self.kind,
            content: self.content.clone(),
            file_url: self.file_url.clone(),
            file_name: self.file_name.clone(),
            reply_to: self.reply_to.clone(),
            reactions: Default::default(),
            read_receipts: Vec::new(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationPayload {
    Send {
        conversation_id: ConversationId,
        message: OutgoingMessage,
    },
    Reaction {
        message_id: MessageId,
        emoji: String,
        active: bool,
    },
    MarkRead {
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub local_id: LocalId,
    pub kind: OperationKind,
    pub payload: OperationPayload,
    pub status: OperationStatus,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("a message is already being sent in conversation {0}")]
    SendInFlight(ConversationId),
    #[error("{kind:?} operations cannot carry this payload")]
    PayloadMismatch { kind: OperationKind },
}

#[derive(Debug, Default)]
pub struct PendingOperations {
    operations: HashMap<LocalId, PendingOperation>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, local_id: &LocalId) -> Option<&PendingOperation> {
        self.operations.get(local_id)
    }

    pub fn is_sending(&self, conversation_id: &ConversationId) -> bool {
        self.operations.values().any(|operation| {
            matches!(
                &operation.payload,
                OperationPayload::Send { conversation_id: pending, .. } if pending == conversation_id
            )
        })
    }

    /// Registers a new optimistic effect. A second send into a conversation
    /// whose previous send is unresolved is refused.
    pub fn begin(
        &mut self,
        kind: OperationKind,
        payload: OperationPayload,
    ) -> Result<LocalId, PendingError> {
        match (&payload, kind.is_send()) {
            (OperationPayload::Send { conversation_id, .. }, true) => {
                if self.is_sending(conversation_id) {
                    return Err(PendingError::SendInFlight(conversation_id.clone()));
                }
            }
            (OperationPayload::Reaction { .. }, false) if kind == OperationKind::ToggleReaction => {}
            (OperationPayload::MarkRead { .. }, false) if kind == OperationKind::MarkRead => {}
            _ => return Err(PendingError::PayloadMismatch { kind }),
        }

        let local_id = MessageId::new(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()));
        self.operations.insert(
            local_id.clone(),
            PendingOperation {
                local_id: local_id.clone(),
                kind,
                payload,
                status: OperationStatus::InFlight,
            },
        );
        Ok(local_id)
    }

    /// Resolves an operation successfully. For sends the confirmed record
    /// replaces the placeholder in `ledger`.
    pub fn commit(
        &mut self,
        local_id: &LocalId,
        confirmed: Option<Message>,
        ledger: &mut MessageLedger,
    ) -> Option<PendingOperation> {
        let mut operation = self.operations.remove(local_id)?;
        if let (true, Some(message)) = (operation.kind.is_send(), confirmed) {
            ledger.reconcile(local_id, Settlement::Confirmed(message));
        }
        operation.status = OperationStatus::Committed;
        Some(operation)
    }

    /// Resolves an operation as failed, rolling sends back out of `ledger`.
    /// Hands back the original payload so the caller can restore its input.
    pub fn fail(
        &mut self,
        local_id: &LocalId,
        ledger: &mut MessageLedger,
    ) -> Option<OperationPayload> {
        let operation = self.operations.remove(local_id)?;
        if operation.kind.is_send() {
            ledger.reconcile(local_id, Settlement::Rejected);
        }
        Some(operation.payload)
    }
}
