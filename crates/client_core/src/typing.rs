//! Typing indicators: who else is typing, and our own outbound state.
//!
//! Remote entries have no expiry of their own; a peer that disconnects
//! between `typing_start` and `typing_stop` leaves its entry behind until the
//! conversation is reopened.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::ConversationEvent,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::transport::{ChannelScope, RealtimeTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Debug, Default, Clone)]
pub struct TypingRoster {
    typing: HashMap<ConversationId, Vec<TypingUser>>,
}

impl TypingRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the user was already listed.
    pub fn start(&mut self, conversation_id: &ConversationId, user: TypingUser) -> bool {
        let users = self.typing.entry(conversation_id.clone()).or_default();
        if users.iter().any(|existing| existing.user_id == user.user_id) {
            return false;
        }
        users.push(user);
        true
    }

    pub fn stop(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let Some(users) = self.typing.get_mut(conversation_id) else {
            return false;
        };
        let before = users.len();
        users.retain(|user| &user.user_id != user_id);
        let removed = users.len() != before;
        if users.is_empty() {
            self.typing.remove(conversation_id);
        }
        removed
    }

    pub fn users(&self, conversation_id: &ConversationId) -> Vec<TypingUser> {
        self.typing
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) -> bool {
        self.typing.remove(conversation_id).is_some()
    }
}

struct ActiveTyping {
    conversation_id: ConversationId,
    token: u64,
    idle_timer: JoinHandle<()>,
}

struct BroadcasterShared {
    transport: Arc<dyn RealtimeTransport>,
    local: TypingUser,
    idle_window: Duration,
    next_token: AtomicU64,
    active: Mutex<Option<ActiveTyping>>,
}

/// Outbound typing state for the local user: `Idle -> Typing -> Idle`.
#[derive(Clone)]
pub struct TypingBroadcaster {
    shared: Arc<BroadcasterShared>,
}

impl TypingBroadcaster {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        local: TypingUser,
        idle_window: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(BroadcasterShared {
                transport,
                local,
                idle_window,
                next_token: AtomicU64::new(1),
                active: Mutex::new(None),
            }),
        }
    }

    pub async fn is_typing(&self) -> bool {
        self.shared.active.lock().await.is_some()
    }

    /// Broadcasts `typing_start` and (re)arms the idle timer.
    pub async fn keystroke(&self, conversation_id: &ConversationId) {
        let mut active = self.shared.active.lock().await;
        if let Some(previous) = active.take() {
            previous.idle_timer.abort();
            if &previous.conversation_id != conversation_id {
                self.shared.publish_stop(&previous.conversation_id).await;
            }
        }

        self.shared
            .publish(
                conversation_id,
                ConversationEvent::TypingStart {
                    user_id: self.shared.local.user_id.clone(),
                    user_name: self.shared.local.user_name.clone(),
                },
            )
            .await;

        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let idle_timer = tokio::spawn(async move {
            tokio::time::sleep(shared.idle_window).await;
            shared.expire(token).await;
        });
        *active = Some(ActiveTyping {
            conversation_id: conversation_id.clone(),
            token,
            idle_timer,
        });
    }

    /// Ends the typing session right away: on send, on leaving the
    /// conversation, on teardown. Returns whether a `typing_stop` went out.
    pub async fn force_stop(&self) -> bool {
        let Some(previous) = self.shared.active.lock().await.take() else {
            return false;
        };
        previous.idle_timer.abort();
        self.shared.publish_stop(&previous.conversation_id).await;
        true
    }
}

impl BroadcasterShared {
    async fn expire(&self, token: u64) {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|typing| typing.token) != Some(token) {
            return;
        }
        // Runs on the timer task itself, so the handle is dropped, not aborted.
        if let Some(expired) = active.take() {
            debug!(conversation_id = %expired.conversation_id, "typing: idle window elapsed");
            self.publish_stop(&expired.conversation_id).await;
        }
    }

    async fn publish_stop(&self, conversation_id: &ConversationId) {
        self.publish(
            conversation_id,
            ConversationEvent::TypingStop {
                user_id: self.local.user_id.clone(),
            },
        )
        .await;
    }

    async fn publish(&self, conversation_id: &ConversationId, event: ConversationEvent) {
        let scope = ChannelScope::Conversation(conversation_id.clone());
        if let Err(err) = self.transport.publish(&scope, &event).await {
            warn!(%scope, "typing: broadcast failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn user(id: &str) -> TypingUser {
        TypingUser {
            user_id: UserId::from(id),
            user_name: id.to_uppercase(),
        }
    }

    fn kinds(transport: &MemoryTransport) -> Vec<&'static str> {
        transport
            .published()
            .into_iter()
            .map(|(_, event)| match event {
                ConversationEvent::TypingStart { .. } => "start",
                ConversationEvent::TypingStop { .. } => "stop",
                _ => "other",
            })
            .collect()
    }

    #[test]
    fn roster_lists_each_user_once() {
        let mut roster = TypingRoster::new();
        let conversation = ConversationId::from("c-1");
        assert!(roster.start(&conversation, user("ana")));
        assert!(!roster.start(&conversation, user("ana")));
        assert!(roster.start(&conversation, user("ben")));
        assert_eq!(roster.users(&conversation).len(), 2);

        assert!(roster.stop(&conversation, &UserId::from("ana")));
        assert!(!roster.stop(&conversation, &UserId::from("ana")));
        assert_eq!(roster.users(&conversation), vec![user("ben")]);
        assert!(roster.users(&ConversationId::from("c-2")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_window_triggers_exactly_one_stop() {
        let transport = MemoryTransport::new(16);
        let broadcaster =
            TypingBroadcaster::new(transport.clone(), user("me"), Duration::from_secs(3));
        let conversation = ConversationId::from("c-1");

        broadcaster.keystroke(&conversation).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        broadcaster.keystroke(&conversation).await;
        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(kinds(&transport), vec!["start", "start"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(kinds(&transport), vec!["start", "start", "stop"]);
        assert!(!broadcaster.is_typing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn force_stop_bypasses_idle_wait_and_cancels_timer() {
        let transport = MemoryTransport::new(16);
        let broadcaster =
            TypingBroadcaster::new(transport.clone(), user("me"), Duration::from_secs(3));

        broadcaster.keystroke(&ConversationId::from("c-1")).await;
        assert!(broadcaster.force_stop().await);
        assert!(!broadcaster.force_stop().await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(kinds(&transport), vec!["start", "stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_in_another_conversation_stops_the_previous_one() {
        let transport = MemoryTransport::new(16);
        let broadcaster =
            TypingBroadcaster::new(transport.clone(), user("me"), Duration::from_secs(3));

        broadcaster.keystroke(&ConversationId::from("c-1")).await;
        broadcaster.keystroke(&ConversationId::from("c-2")).await;

        let published = transport.published();
        assert_eq!(kinds(&transport), vec!["start", "stop", "start"]);
        assert_eq!(
            published[1].0,
            ChannelScope::Conversation(ConversationId::from("c-1"))
        );
    }
}
