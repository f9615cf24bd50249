//! Optimistic read receipts for messages the local user has on screen.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::ReadReceipt,
};

use crate::{conversations::ConversationIndex, ledger::MessageLedger};

pub struct ReadReceiptTracker;

impl ReadReceiptTracker {
    /// Stamps every unread message from someone else with a receipt for
    /// `local_user` and clears the conversation's unread badge. Returns the
    /// ids that still need committing, one call each; empty when there was
    /// nothing to do.
    pub fn mark_visible_as_read(
        ledger: &mut MessageLedger,
        index: &mut ConversationIndex,
        conversation_id: &ConversationId,
        local_user: &UserId,
        now: DateTime<Utc>,
    ) -> Vec<MessageId> {
        if ledger.conversation_id() != Some(conversation_id) {
            return Vec::new();
        }
        let unread = ledger.unread_from_others(local_user);
        if unread.is_empty() {
            return unread;
        }
        for message_id in &unread {
            ledger.record_read_receipt(
                message_id,
                ReadReceipt {
                    user_id: local_user.clone(),
                    read_at: now,
                },
            );
        }
        index.reset_unread(conversation_id);
        unread
    }
}
