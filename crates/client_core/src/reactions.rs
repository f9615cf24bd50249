//! Optimistic reaction toggles with a debounced network commit.

use std::{collections::HashMap, future::Future, time::Duration};

use shared::{domain::MessageId, protocol::ReactionUser};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ledger::MessageLedger;

#[derive(Debug, Clone)]
struct ReactionDraft {
    user: ReactionUser,
    /// State the server last agreed to, as far as we know.
    committed_active: bool,
    desired_active: bool,
}

/// Final desired state of one `(message, emoji)` pair after a debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionCommit {
    pub message_id: MessageId,
    pub emoji: String,
    pub user: ReactionUser,
    pub active: bool,
}

pub struct ReactionToggleManager {
    debounce: Duration,
    drafts: HashMap<(MessageId, String), ReactionDraft>,
    flush_timer: Option<JoinHandle<()>>,
}

impl ReactionToggleManager {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            drafts: HashMap::new(),
            flush_timer: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.drafts.is_empty()
    }

    /// Flips the reaction in `ledger` right away and records the new desired
    /// state. Returns `None` when the message is not loaded.
    pub fn toggle(
        &mut self,
        ledger: &mut MessageLedger,
        message_id: &MessageId,
        emoji: &str,
        user: ReactionUser,
    ) -> Option<bool> {
        let active = ledger.toggle_reaction(message_id, emoji, user.clone())?;
        self.drafts
            .entry((message_id.clone(), emoji.to_string()))
            .and_modify(|draft| draft.desired_active = active)
            .or_insert(ReactionDraft {
                user,
                committed_active: !active,
                desired_active: active,
            });
        Some(active)
    }

    /// (Re)starts the debounce window; `flush` runs once it closes without
    /// another toggle.
    pub fn arm<F>(&mut self, flush: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.flush_timer.take() {
            previous.abort();
        }
        let debounce = self.debounce;
        self.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            flush.await;
        }));
    }

    /// Drains the drafts into commits, skipping pairs toggled back to where
    /// they started. Does not touch the timer: this is called from it.
    pub fn take_commits(&mut self) -> Vec<ReactionCommit> {
        self.flush_timer = None;
        let commits: Vec<ReactionCommit> = self
            .drafts
            .drain()
            .filter(|(_, draft)| draft.desired_active != draft.committed_active)
            .map(|((message_id, emoji), draft)| ReactionCommit {
                message_id,
                emoji,
                user: draft.user,
                active: draft.desired_active,
            })
            .collect();
        debug!(count = commits.len(), "reactions: debounce window closed");
        commits
    }

    /// Cancels the pending window and hands back whatever was waiting in it,
    /// so the caller can commit it immediately.
    pub fn cancel(&mut self) -> Vec<ReactionCommit> {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
        self.take_commits()
    }

    /// Undoes a commit the server refused by toggling once more, provided
    /// nothing changed the reaction in the meantime.
    pub fn rollback(&self, ledger: &mut MessageLedger, commit: &ReactionCommit) -> bool {
        let Some(message) = ledger.get(&commit.message_id) else {
            return false;
        };
        if message.has_reaction(&commit.emoji, &commit.user.user_id) != commit.active {
            return false;
        }
        ledger
            .toggle_reaction(&commit.message_id, &commit.emoji, commit.user.clone())
            .is_some()
    }
}

impl Drop for ReactionToggleManager {
    fn drop(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use shared::domain::{ConversationId, UserId};

    use super::*;
    use crate::ledger::tests::message;

    fn me() -> ReactionUser {
        ReactionUser {
            user_id: UserId::from("me"),
            user_name: "Me".to_string(),
        }
    }

    fn loaded_ledger() -> MessageLedger {
        let mut ledger = MessageLedger::for_conversation(ConversationId::from("c-1"));
        ledger.merge_inbound(message("m-1", "bob", 1), &UserId::from("me"));
        ledger
    }

    #[test]
    fn odd_number_of_toggles_commits_final_state_once() {
        let mut ledger = loaded_ledger();
        let mut manager = ReactionToggleManager::new(Duration::from_millis(300));
        let id = MessageId::from("m-1");
        for _ in 0..3 {
            manager.toggle(&mut ledger, &id, "👍", me()).expect("loaded");
        }

        let commits = manager.take_commits();
        assert_eq!(
            commits,
            vec![ReactionCommit {
                message_id: id.clone(),
                emoji: "👍".to_string(),
                user: me(),
                active: true,
            }]
        );
        assert!(ledger
            .get(&id)
            .expect("message")
            .has_reaction("👍", &UserId::from("me")));
    }

    #[test]
    fn toggling_back_to_start_commits_nothing() {
        let mut ledger = loaded_ledger();
        let mut manager = ReactionToggleManager::new(Duration::from_millis(300));
        let id = MessageId::from("m-1");
        manager.toggle(&mut ledger, &id, "👍", me());
        manager.toggle(&mut ledger, &id, "👍", me());
        assert!(manager.take_commits().is_empty());
        assert!(!manager.has_pending());
    }

    #[test]
    fn toggle_on_missing_message_records_nothing() {
        let mut ledger = loaded_ledger();
        let mut manager = ReactionToggleManager::new(Duration::from_millis(300));
        assert_eq!(
            manager.toggle(&mut ledger, &MessageId::from("m-404"), "👍", me()),
            None
        );
        assert!(!manager.has_pending());
    }

    #[test]
    fn rollback_restores_pre_toggle_state() {
        let mut ledger = loaded_ledger();
        let mut manager = ReactionToggleManager::new(Duration::from_millis(300));
        let id = MessageId::from("m-1");
        manager.toggle(&mut ledger, &id, "🎉", me());
        let commit = manager.take_commits().remove(0);

        assert!(manager.rollback(&mut ledger, &commit));
        assert!(ledger.get(&id).expect("message").reactions.is_empty());
        assert!(!manager.rollback(&mut ledger, &commit));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_restarts_the_window() {
        let mut manager = ReactionToggleManager::new(Duration::from_millis(300));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            manager.arm(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_the_flush() {
        let mut ledger = loaded_ledger();
        let mut manager = ReactionToggleManager::new(Duration::from_millis(300));
        let fired = Arc::new(AtomicUsize::new(0));
        manager.toggle(&mut ledger, &MessageId::from("m-1"), "👍", me());
        let counter = Arc::clone(&fired);
        manager.arm(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let drained = manager.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(drained.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
