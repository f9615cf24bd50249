//! Ordered, deduplicated message list for the active conversation.

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{Message, ReactionUser, ReadReceipt},
};

/// Authoritative answer for an optimistic entry.
#[derive(Debug, Clone)]
pub enum Settlement {
    Confirmed(Message),
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    SelfEcho,
    Duplicate,
    ForeignConversation,
}

#[derive(Debug, Default, Clone)]
pub struct MessageLedger {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            messages: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn sorted_view(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Optimistic insert at the tail; no re-sort so the entry shows up where
    /// the user expects it.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Swaps or drops the optimistic entry `temp_id`. Returns the entry that
    /// was removed, which on rejection carries the user's original input.
    pub fn reconcile(&mut self, temp_id: &MessageId, settlement: Settlement) -> Option<Message> {
        let index = self.position(temp_id)?;
        match settlement {
            Settlement::Confirmed(confirmed) => {
                if self.position(&confirmed.id).is_some() {
                    // Confirmed record already arrived through another path.
                    return Some(self.messages.remove(index));
                }
                let previous = std::mem::replace(&mut self.messages[index], confirmed);
                self.sort();
                Some(previous)
            }
            Settlement::Rejected => Some(self.messages.remove(index)),
        }
    }

    /// Single entry point for realtime-delivered messages.
    pub fn merge_inbound(&mut self, message: Message, local_user: &UserId) -> MergeOutcome {
        if &message.sender_id == local_user {
            return MergeOutcome::SelfEcho;
        }
        self.insert_deduplicated(message)
    }

    /// Fetch fallback. Fetched records overwrite the entry with the same id
    /// and new ones go through the same dedup path as realtime deliveries.
    /// Nothing already in the ledger is dropped: the fetch may predate
    /// messages merged while it was in flight.
    pub fn merge_fetched(&mut self, fetched: Vec<Message>) {
        for message in fetched {
            match self.find_mut(&message.id) {
                Some(existing) if existing.conversation_id == message.conversation_id => {
                    *existing = message;
                }
                Some(_) => {}
                None => {
                    self.insert_deduplicated(message);
                }
            }
        }
        self.sort();
    }

    /// Flips `user`'s reaction. Returns the new state, or `None` when the
    /// message is not loaded.
    pub fn toggle_reaction(
        &mut self,
        message_id: &MessageId,
        emoji: &str,
        user: ReactionUser,
    ) -> Option<bool> {
        let message = self.find_mut(message_id)?;
        if message.has_reaction(emoji, &user.user_id) {
            remove_reaction(message, emoji, &user.user_id);
            Some(false)
        } else {
            message
                .reactions
                .entry(emoji.to_string())
                .or_default()
                .push(user);
            Some(true)
        }
    }

    pub fn apply_reaction_added(
        &mut self,
        message_id: &MessageId,
        emoji: &str,
        user: ReactionUser,
    ) -> bool {
        let Some(message) = self.find_mut(message_id) else {
            return false;
        };
        if message.has_reaction(emoji, &user.user_id) {
            return false;
        }
        message
            .reactions
            .entry(emoji.to_string())
            .or_default()
            .push(user);
        true
    }

    pub fn apply_reaction_removed(
        &mut self,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> bool {
        let Some(message) = self.find_mut(message_id) else {
            return false;
        };
        if !message.has_reaction(emoji, user_id) {
            return false;
        }
        remove_reaction(message, emoji, user_id);
        true
    }

    /// Last write wins per user.
    pub fn record_read_receipt(&mut self, message_id: &MessageId, receipt: ReadReceipt) -> bool {
        let Some(message) = self.find_mut(message_id) else {
            return false;
        };
        match message
            .read_receipts
            .iter_mut()
            .find(|existing| existing.user_id == receipt.user_id)
        {
            Some(existing) if existing.read_at == receipt.read_at => false,
            Some(existing) => {
                existing.read_at = receipt.read_at;
                true
            }
            None => {
                message.read_receipts.push(receipt);
                true
            }
        }
    }

    /// Confirmed messages from other senders that `local_user` has not read.
    pub fn unread_from_others(&self, local_user: &UserId) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|message| {
                &message.sender_id != local_user
                    && !message.id.is_temporary()
                    && !message.is_read_by(local_user)
            })
            .map(|message| message.id.clone())
            .collect()
    }

    fn insert_deduplicated(&mut self, message: Message) -> MergeOutcome {
        if let Some(conversation_id) = &self.conversation_id {
            if &message.conversation_id != conversation_id {
                return MergeOutcome::ForeignConversation;
            }
        }
        if self.position(&message.id).is_some() {
            return MergeOutcome::Duplicate;
        }
        self.messages.push(message);
        self.sort();
        MergeOutcome::Inserted
    }

    fn sort(&mut self) {
        self.messages
            .sort_by(|left, right| left.created_at.cmp(&right.created_at));
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    fn find_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }
}

fn remove_reaction(message: &mut Message, emoji: &str, user_id: &UserId) {
    if let Some(users) = message.reactions.get_mut(emoji) {
        users.retain(|user| &user.user_id != user_id);
        if users.is_empty() {
            message.reactions.remove(emoji);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, TimeZone, Utc};
    use shared::domain::MessageKind;

    use super::*;

    pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("timestamp")
    }

    pub(crate) fn message(id: &str, sender: &str, seconds: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("c-1"),
            sender_id: UserId::from(sender),
            sender_name: Some(sender.to_uppercase()),
            kind: MessageKind::Text,
            content: format!("body of {id}"),
            file_url: None,
            file_name: None,
            reply_to: None,
            reactions: BTreeMap::new(),
            read_receipts: Vec::new(),
            created_at: at(seconds),
        }
    }

    fn ids(ledger: &MessageLedger) -> Vec<&str> {
        ledger
            .sorted_view()
            .iter()
            .map(|message| message.id.as_str())
            .collect()
    }

    fn in_other_conversation(mut message: Message) -> Message {
        message.conversation_id = ConversationId::from("c-2");
        message
    }

    fn me() -> UserId {
        UserId::from("me")
    }

    #[test]
    fn duplicate_inbound_delivery_yields_one_entry() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        assert_eq!(
            ledger.merge_inbound(message("m-1", "bob", 1), &me()),
            MergeOutcome::Inserted
        );
        assert_eq!(
            ledger.merge_inbound(message("m-1", "bob", 1), &me()),
            MergeOutcome::Duplicate
        );
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn self_echo_does_not_duplicate_optimistic_entry() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.append(message("temp-1", "me", 5));
        assert_eq!(
            ledger.merge_inbound(message("m-42", "me", 5), &me()),
            MergeOutcome::SelfEcho
        );
        assert_eq!(ids(&ledger), vec!["temp-1"]);
    }

    #[test]
    fn messages_for_other_conversations_are_dropped() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-2"));
        assert_eq!(
            ledger.merge_inbound(message("m-1", "bob", 1), &me()),
            MergeOutcome::ForeignConversation
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn confirmed_send_replaces_temp_entry_and_resorts() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.merge_inbound(message("m-1", "bob", 10), &me());
        ledger.merge_inbound(message("m-3", "bob", 30), &me());
        let mut optimistic = message("temp-1", "me", 40);
        optimistic.content = "hi".to_string();
        ledger.append(optimistic);

        let mut confirmed = message("m-42", "me", 20);
        confirmed.content = "hi".to_string();
        let replaced = ledger
            .reconcile(&MessageId::from("temp-1"), Settlement::Confirmed(confirmed))
            .expect("temp entry");

        assert_eq!(replaced.id.as_str(), "temp-1");
        assert_eq!(ids(&ledger), vec!["m-1", "m-42", "m-3"]);
    }

    #[test]
    fn rejected_send_removes_temp_entry_and_returns_input() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        let mut optimistic = message("temp-1", "me", 1);
        optimistic.content = "hi".to_string();
        ledger.append(optimistic);

        let removed = ledger
            .reconcile(&MessageId::from("temp-1"), Settlement::Rejected)
            .expect("temp entry");

        assert_eq!(removed.content, "hi");
        assert!(ledger.get(&MessageId::from("temp-1")).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn confirmation_for_already_present_record_drops_temp_entry() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.append(message("temp-1", "me", 1));
        ledger.merge_fetched(vec![message("m-42", "me", 2)]);

        ledger.reconcile(
            &MessageId::from("temp-1"),
            Settlement::Confirmed(message("m-42", "me", 2)),
        );

        assert_eq!(ids(&ledger), vec!["m-42"]);
    }

    #[test]
    fn reconcile_of_unknown_temp_id_is_a_no_op() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.merge_inbound(message("m-1", "bob", 1), &me());
        assert!(ledger
            .reconcile(
                &MessageId::from("temp-9"),
                Settlement::Confirmed(message("m-9", "me", 2))
            )
            .is_none());
        assert_eq!(ids(&ledger), vec!["m-1"]);
    }

    #[test]
    fn view_stays_sorted_under_out_of_order_delivery() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        for (id, seconds) in [("m-5", 5), ("m-2", 2), ("m-9", 9), ("m-1", 1), ("m-2", 2)] {
            ledger.merge_inbound(message(id, "bob", seconds), &me());
        }
        ledger.append(message("temp-1", "me", 6));
        ledger.merge_inbound(message("m-7", "bob", 7), &me());
        ledger.reconcile(
            &MessageId::from("temp-1"),
            Settlement::Confirmed(message("m-3", "me", 3)),
        );

        let view = ledger.sorted_view();
        assert!(view
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));
        assert_eq!(ids(&ledger), vec!["m-1", "m-2", "m-3", "m-5", "m-7", "m-9"]);
    }

    #[test]
    fn fetch_keeps_pending_entries_and_own_history() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.append(message("temp-1", "me", 50));

        ledger.merge_fetched(vec![
            message("m-2", "me", 2),
            message("m-1", "bob", 1),
            message("m-2", "me", 2),
        ]);

        assert_eq!(ids(&ledger), vec!["m-1", "m-2", "temp-1"]);
    }

    #[test]
    fn fetch_never_drops_messages_merged_while_it_was_in_flight() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.merge_inbound(message("m-3", "bob", 3), &me());
        let mut reacted = message("m-1", "bob", 1);
        reacted.reactions.insert(
            "👍".to_string(),
            vec![ReactionUser {
                user_id: UserId::from("bob"),
                user_name: "Bob".to_string(),
            }],
        );
        ledger.merge_inbound(message("m-1", "bob", 1), &me());

        ledger.merge_fetched(vec![reacted, in_other_conversation(message("m-8", "bob", 8))]);

        assert_eq!(ids(&ledger), vec!["m-1", "m-3"]);
        assert!(ledger
            .get(&MessageId::from("m-1"))
            .expect("message")
            .has_reaction("👍", &UserId::from("bob")));
    }

    #[test]
    fn toggling_a_reaction_twice_restores_original_state() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.merge_inbound(message("m-1", "bob", 1), &me());
        let original = ledger.get(&MessageId::from("m-1")).expect("message").clone();
        let user = ReactionUser {
            user_id: me(),
            user_name: "Me".to_string(),
        };

        assert_eq!(
            ledger.toggle_reaction(&MessageId::from("m-1"), "🔥", user.clone()),
            Some(true)
        );
        assert_eq!(
            ledger.toggle_reaction(&MessageId::from("m-1"), "🔥", user),
            Some(false)
        );
        assert_eq!(
            ledger.get(&MessageId::from("m-1")).expect("message"),
            &original
        );
    }

    #[test]
    fn inbound_reaction_events_are_idempotent() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.merge_inbound(message("m-1", "bob", 1), &me());
        let reactor = ReactionUser {
            user_id: UserId::from("u-9"),
            user_name: "Nine".to_string(),
        };
        let id = MessageId::from("m-1");

        assert!(ledger.apply_reaction_added(&id, "👍", reactor.clone()));
        assert!(!ledger.apply_reaction_added(&id, "👍", reactor.clone()));
        assert_eq!(ledger.get(&id).expect("message").reactions["👍"].len(), 1);

        assert!(ledger.apply_reaction_removed(&id, "👍", &reactor.user_id));
        assert!(!ledger.apply_reaction_removed(&id, "👍", &reactor.user_id));
        assert!(ledger.get(&id).expect("message").reactions.is_empty());
    }

    #[test]
    fn mutations_on_absent_messages_are_no_ops() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        let missing = MessageId::from("m-404");
        let user = ReactionUser {
            user_id: me(),
            user_name: "Me".to_string(),
        };
        assert_eq!(ledger.toggle_reaction(&missing, "👍", user.clone()), None);
        assert!(!ledger.apply_reaction_added(&missing, "👍", user));
        assert!(!ledger.record_read_receipt(
            &missing,
            ReadReceipt {
                user_id: me(),
                read_at: at(1)
            }
        ));
    }

    #[test]
    fn read_receipts_are_last_write_wins_per_user() {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.merge_inbound(message("m-1", "bob", 1), &me());
        let id = MessageId::from("m-1");
        assert!(ledger.record_read_receipt(
            &id,
            ReadReceipt {
                user_id: me(),
                read_at: at(5)
            }
        ));
        assert!(ledger.record_read_receipt(
            &id,
            ReadReceipt {
                user_id: me(),
                read_at: at(9)
            }
        ));
        let receipts = &ledger.get(&id).expect("message").read_receipts;
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].read_at, at(9));
        assert!(ledger.unread_from_others(&me()).is_empty());
    }
}
