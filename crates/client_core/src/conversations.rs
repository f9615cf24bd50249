//! Conversation summaries, independent of which conversation is open.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, UserId},
    protocol::ConversationRecord,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// The other participant of a DIRECT conversation.
    pub counterpart_id: Option<UserId>,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub is_online: bool,
}

impl ConversationSummary {
    pub fn from_record(record: &ConversationRecord, local_user: &UserId) -> Self {
        let counterpart = match record.kind {
            ConversationKind::Direct => record
                .participants
                .iter()
                .find(|participant| &participant.user_id != local_user),
            ConversationKind::Group => None,
        };

        let display_name = counterpart
            .map(|participant| participant.name.clone())
            .or_else(|| record.name.clone())
            .unwrap_or_else(|| {
                record
                    .participants
                    .iter()
                    .filter(|participant| &participant.user_id != local_user)
                    .map(|participant| participant.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            });

        Self {
            id: record.id.clone(),
            kind: record.kind,
            display_name,
            avatar_url: counterpart
                .and_then(|participant| participant.avatar_url.clone())
                .or_else(|| record.avatar_url.clone()),
            counterpart_id: counterpart.map(|participant| participant.user_id.clone()),
            last_message: record.last_message.clone(),
            last_message_time: record.last_message_time,
            unread_count: record.unread_count.unwrap_or(0),
            is_online: counterpart
                .and_then(|participant| participant.is_online)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationIndex {
    local_user: UserId,
    summaries: Vec<ConversationSummary>,
}

impl ConversationIndex {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            summaries: Vec::new(),
        }
    }

    pub fn sorted(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn get(&self, id: &ConversationId) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|summary| &summary.id == id)
    }

    /// Inserts a new summary or merges the known fields of `record` into the
    /// existing one. The locally tracked unread count of an existing entry is
    /// kept. Returns `true` when the conversation was new.
    pub fn upsert(&mut self, record: &ConversationRecord) -> bool {
        let incoming = ConversationSummary::from_record(record, &self.local_user);
        let inserted = match self.find_mut(&record.id) {
            Some(existing) => {
                existing.kind = incoming.kind;
                existing.display_name = incoming.display_name;
                if incoming.avatar_url.is_some() {
                    existing.avatar_url = incoming.avatar_url;
                }
                let presence_known = record
                    .participants
                    .iter()
                    .find(|participant| {
                        Some(&participant.user_id) == incoming.counterpart_id.as_ref()
                    })
                    .is_some_and(|participant| participant.is_online.is_some());
                if presence_known {
                    existing.is_online = incoming.is_online;
                }
                existing.counterpart_id = incoming.counterpart_id;
                if let Some(time) = incoming.last_message_time {
                    if existing.last_message_time.map_or(true, |known| known <= time) {
                        existing.last_message_time = Some(time);
                        existing.last_message = incoming.last_message;
                    }
                }
                false
            }
            None => {
                self.summaries.push(incoming);
                true
            }
        };
        self.sort();
        inserted
    }

    pub fn bump_last_message(
        &mut self,
        id: &ConversationId,
        preview: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(summary) = self.find_mut(id) else {
            return false;
        };
        summary.last_message = Some(preview.into());
        summary.last_message_time = Some(timestamp);
        self.sort();
        true
    }

    pub fn increment_unread(&mut self, id: &ConversationId) -> bool {
        let Some(summary) = self.find_mut(id) else {
            return false;
        };
        summary.unread_count = summary.unread_count.saturating_add(1);
        true
    }

    pub fn reset_unread(&mut self, id: &ConversationId) -> bool {
        match self.find_mut(id) {
            Some(summary) if summary.unread_count > 0 => {
                summary.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Updates every DIRECT conversation whose counterpart is `user_id`.
    /// Returns how many summaries changed.
    pub fn set_presence(&mut self, user_id: &UserId, is_online: bool) -> usize {
        let mut changed = 0;
        for summary in self.summaries.iter_mut().filter(|summary| {
            summary.kind == ConversationKind::Direct
                && summary.counterpart_id.as_ref() == Some(user_id)
        }) {
            if summary.is_online != is_online {
                summary.is_online = is_online;
                changed += 1;
            }
        }
        changed
    }

    fn sort(&mut self) {
        // Conversations without any message sort last.
        self.summaries
            .sort_by_key(|summary| Reverse(summary.last_message_time));
    }

    fn find_mut(&mut self, id: &ConversationId) -> Option<&mut ConversationSummary> {
        self.summaries.iter_mut().find(|summary| &summary.id == id)
    }
}
