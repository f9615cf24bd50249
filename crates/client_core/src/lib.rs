use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, UserId},
    protocol::{
        ConversationEvent, CreateConversationRequest, MarkReadRequest, Message, ReactionUser,
        ReadReceipt, SetReactionRequest, UserNotice, UserSearchResult,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod config;
pub mod conversations;
pub mod error;
pub mod http;
pub mod ledger;
pub mod pending;
pub mod reactions;
pub mod read_receipts;
pub mod router;
pub mod transport;
pub mod typing;
pub mod ws;

pub use config::{load_settings, ClientSettings};
pub use conversations::{ConversationIndex, ConversationSummary};
pub use error::ChatError;
pub use ledger::MessageLedger;
pub use pending::OutgoingMessage;
pub use transport::{ChatApi, MemoryTransport, Notifier, RealtimeTransport, TracingNotifier};
pub use typing::TypingUser;

use crate::{
    ledger::MergeOutcome,
    pending::{OperationKind, OperationPayload, PendingOperations},
    reactions::{ReactionCommit, ReactionToggleManager},
    read_receipts::ReadReceiptTracker,
    router::{EventSink, RealtimeEventRouter},
    transport::ChannelScope,
    typing::{TypingBroadcaster, TypingRoster},
};

/// Change notifications for the UI layer. Projections are re-read through
/// the client's getters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    MessagesChanged {
        conversation_id: ConversationId,
    },
    ConversationsChanged,
    TypingChanged {
        conversation_id: ConversationId,
        users: Vec<TypingUser>,
    },
    SendFailed {
        conversation_id: ConversationId,
        restored: OutgoingMessage,
        reason: String,
    },
    /// User-visible, non-blocking notice.
    Notice(String),
    IncomingCall {
        call_id: String,
        conversation_id: ConversationId,
        caller_id: UserId,
        caller_name: String,
        video: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub user_name: String,
}

struct ChatState {
    active: Option<ConversationId>,
    /// Bumped on every conversation switch; fetches from an older generation
    /// are discarded.
    generation: u64,
    foreground: bool,
    ledger: MessageLedger,
    index: ConversationIndex,
    pending: PendingOperations,
    typing: TypingRoster,
    reactions: ReactionToggleManager,
}

impl ChatState {
    fn leave_active(&mut self) -> Vec<ReactionCommit> {
        let drained = self.reactions.cancel();
        if let Some(previous) = self.active.take() {
            self.typing.clear_conversation(&previous);
        }
        self.generation += 1;
        self.ledger = MessageLedger::new();
        drained
    }
}

pub struct ChatClient {
    identity: LocalIdentity,
    api: Arc<dyn ChatApi>,
    notifier: Arc<dyn Notifier>,
    typing: TypingBroadcaster,
    router: Mutex<RealtimeEventRouter>,
    inner: Mutex<ChatState>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatClient {
    pub fn new(
        identity: LocalIdentity,
        settings: &ClientSettings,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Arc<Self> {
        Self::new_with_notifier(identity, settings, api, transport, Arc::new(TracingNotifier))
    }

    pub fn new_with_notifier(
        identity: LocalIdentity,
        settings: &ClientSettings,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn RealtimeTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let typing = TypingBroadcaster::new(
            Arc::clone(&transport),
            TypingUser {
                user_id: identity.user_id.clone(),
                user_name: identity.user_name.clone(),
            },
            settings.typing_idle(),
        );
        Arc::new(Self {
            api,
            notifier,
            router: Mutex::new(RealtimeEventRouter::new(transport, typing.clone())),
            typing,
            inner: Mutex::new(ChatState {
                active: None,
                generation: 0,
                foreground: true,
                ledger: MessageLedger::new(),
                index: ConversationIndex::new(identity.user_id.clone()),
                pending: PendingOperations::new(),
                typing: TypingRoster::new(),
                reactions: ReactionToggleManager::new(settings.reaction_debounce()),
            }),
            identity,
            events,
        })
    }

    pub fn local_user(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active.clone()
    }

    /// Sorted message list of the open conversation.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.ledger.sorted_view().to_vec()
    }

    /// Conversation summaries, most recently active first.
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.index.sorted().to_vec()
    }

    pub async fn typing_users(&self, conversation_id: &ConversationId) -> Vec<TypingUser> {
        self.inner.lock().await.typing.users(conversation_id)
    }

    pub async fn connect_user_channel(self: &Arc<Self>) -> Result<(), ChatError> {
        let sink: Arc<dyn EventSink> = Arc::clone(self) as Arc<dyn EventSink>;
        self.router
            .lock()
            .await
            .open_user(&self.identity.user_id, sink)
            .await?;
        Ok(())
    }

    pub async fn load_conversations(&self) -> Result<usize, ChatError> {
        let records = self
            .api
            .list_conversations()
            .await
            .map_err(ChatError::from_seam)?;
        let count = records.len();
        {
            let mut guard = self.inner.lock().await;
            for record in &records {
                guard.index.upsert(record);
            }
        }
        self.emit(ChatEvent::ConversationsChanged);
        Ok(count)
    }

    /// Makes `conversation_id` the active conversation: subscribes to its
    /// channel, loads its messages and marks them read when visible.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<(), ChatError> {
        let (generation, drained) = {
            let mut guard = self.inner.lock().await;
            let drained = guard.leave_active();
            guard.active = Some(conversation_id.clone());
            guard.ledger = MessageLedger::for_conversation(conversation_id.clone());
            guard.index.reset_unread(conversation_id);
            (guard.generation, drained)
        };
        self.spawn_reaction_commits(drained);
        info!(%conversation_id, generation, "chat: opening conversation");

        let sink: Arc<dyn EventSink> = Arc::clone(self) as Arc<dyn EventSink>;
        let subscribed = self
            .router
            .lock()
            .await
            .open_conversation(conversation_id, sink)
            .await;
        if let Err(err) = subscribed {
            warn!(%conversation_id, "chat: subscribe failed: {err}");
            let mut guard = self.inner.lock().await;
            if guard.generation == generation {
                guard.leave_active();
            }
            return Err(err.into());
        }

        let fetched = self
            .api
            .list_messages(conversation_id)
            .await
            .map_err(ChatError::from_seam)?;
        let foreground = {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                debug!(%conversation_id, "chat: discarding stale message fetch");
                return Err(ChatError::StaleConversation(conversation_id.clone()));
            }
            guard.ledger.merge_fetched(fetched);
            guard.foreground
        };
        self.emit(ChatEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        self.emit(ChatEvent::ConversationsChanged);

        if foreground {
            self.mark_visible_as_read(conversation_id).await;
        }
        Ok(())
    }

    /// Fetch-and-replace fallback for the open conversation.
    pub async fn refresh_messages(&self) -> Result<(), ChatError> {
        let (conversation_id, generation) = {
            let guard = self.inner.lock().await;
            let conversation_id = guard
                .active
                .clone()
                .ok_or(ChatError::NoActiveConversation)?;
            (conversation_id, guard.generation)
        };
        let fetched = self
            .api
            .list_messages(&conversation_id)
            .await
            .map_err(ChatError::from_seam)?;
        {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                return Err(ChatError::StaleConversation(conversation_id));
            }
            guard.ledger.merge_fetched(fetched);
        }
        self.emit(ChatEvent::MessagesChanged { conversation_id });
        Ok(())
    }

    pub async fn close_conversation(self: &Arc<Self>) {
        self.router.lock().await.close_conversation().await;
        let drained = self.inner.lock().await.leave_active();
        self.spawn_reaction_commits(drained);
    }

    pub async fn set_foreground(&self, visible: bool) {
        let active = {
            let mut guard = self.inner.lock().await;
            guard.foreground = visible;
            guard.active.clone()
        };
        if let (true, Some(conversation_id)) = (visible, active) {
            self.mark_visible_as_read(&conversation_id).await;
        }
    }

    pub async fn send_text(self: &Arc<Self>, text: &str) -> Result<Message, ChatError> {
        self.send_message(OutgoingMessage::text(text)).await
    }

    pub async fn send_gif(self: &Arc<Self>, url: &str) -> Result<Message, ChatError> {
        self.send_message(OutgoingMessage::gif(url)).await
    }

    /// Shows `outgoing` immediately, then swaps in the server's record. On
    /// failure the placeholder is withdrawn and the input handed back inside
    /// `ChatError::SendRejected`.
    pub async fn send_message(
        self: &Arc<Self>,
        outgoing: OutgoingMessage,
    ) -> Result<Message, ChatError> {
        let kind = match outgoing.kind {
            shared::domain::MessageKind::Gif => OperationKind::SendGif,
            _ => OperationKind::SendMessage,
        };
        let (conversation_id, local_id) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let conversation_id = state
                .active
                .clone()
                .ok_or(ChatError::NoActiveConversation)?;
            let local_id = state.pending.begin(
                kind,
                OperationPayload::Send {
                    conversation_id: conversation_id.clone(),
                    message: outgoing.clone(),
                },
            )?;
            let optimistic = outgoing.optimistic(
                &local_id,
                &conversation_id,
                &self.identity.user_id,
                &self.identity.user_name,
                Utc::now(),
            );
            state.index.bump_last_message(
                &conversation_id,
                optimistic.preview(),
                optimistic.created_at,
            );
            state.ledger.append(optimistic);
            (conversation_id, local_id)
        };
        self.emit(ChatEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        self.emit(ChatEvent::ConversationsChanged);
        self.typing.force_stop().await;

        let result = self
            .api
            .create_message(outgoing.to_request(&conversation_id))
            .await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        match result {
            Ok(confirmed) => {
                state
                    .pending
                    .commit(&local_id, Some(confirmed.clone()), &mut state.ledger);
                state.index.bump_last_message(
                    &conversation_id,
                    confirmed.preview(),
                    confirmed.created_at,
                );
                drop(guard);
                info!(%conversation_id, message_id = %confirmed.id, "chat: message confirmed");
                self.emit(ChatEvent::MessagesChanged {
                    conversation_id: conversation_id.clone(),
                });
                self.emit(ChatEvent::ConversationsChanged);
                Ok(confirmed)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(%conversation_id, "chat: send failed: {reason}");
                let restored = match state.pending.fail(&local_id, &mut state.ledger) {
                    Some(OperationPayload::Send { message, .. }) => message,
                    _ => outgoing,
                };
                if state.ledger.conversation_id() == Some(&conversation_id) {
                    if let Some(tail) = state.ledger.last() {
                        let (preview, time) = (tail.preview(), tail.created_at);
                        state
                            .index
                            .bump_last_message(&conversation_id, preview, time);
                    }
                }
                drop(guard);
                self.emit(ChatEvent::MessagesChanged {
                    conversation_id: conversation_id.clone(),
                });
                self.emit(ChatEvent::SendFailed {
                    conversation_id,
                    restored: restored.clone(),
                    reason: reason.clone(),
                });
                self.emit(ChatEvent::Notice("Message could not be sent".to_string()));
                Err(ChatError::SendRejected { restored, reason })
            }
        }
    }

    /// Flips the local user's `emoji` on `message_id`. The server hears about
    /// it once toggling settles. Returns the new state, or `None` if the
    /// message is not loaded.
    pub async fn toggle_reaction(
        self: &Arc<Self>,
        message_id: &MessageId,
        emoji: &str,
    ) -> Option<bool> {
        let user = ReactionUser {
            user_id: self.identity.user_id.clone(),
            user_name: self.identity.user_name.clone(),
        };
        let (active, conversation_id) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let active = state
                .reactions
                .toggle(&mut state.ledger, message_id, emoji, user)?;
            let client = Arc::clone(self);
            state.reactions.arm(async move {
                client.flush_reactions().await;
            });
            (active, state.ledger.conversation_id().cloned())
        };
        if let Some(conversation_id) = conversation_id {
            self.emit(ChatEvent::MessagesChanged { conversation_id });
        }
        Some(active)
    }

    async fn flush_reactions(&self) {
        let commits = self.inner.lock().await.reactions.take_commits();
        self.commit_reactions(commits).await;
    }

    fn spawn_reaction_commits(self: &Arc<Self>, commits: Vec<ReactionCommit>) {
        if commits.is_empty() {
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.commit_reactions(commits).await;
        });
    }

    async fn commit_reactions(&self, commits: Vec<ReactionCommit>) {
        join_all(commits.into_iter().map(|commit| self.commit_reaction(commit))).await;
    }

    async fn commit_reaction(&self, commit: ReactionCommit) {
        let local_id = {
            let mut guard = self.inner.lock().await;
            guard.pending.begin(
                OperationKind::ToggleReaction,
                OperationPayload::Reaction {
                    message_id: commit.message_id.clone(),
                    emoji: commit.emoji.clone(),
                    active: commit.active,
                },
            )
        };
        let result = self
            .api
            .set_reaction(SetReactionRequest {
                message_id: commit.message_id.clone(),
                emoji: commit.emoji.clone(),
                active: commit.active,
            })
            .await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        match result {
            Ok(()) => {
                if let Ok(local_id) = &local_id {
                    state.pending.commit(local_id, None, &mut state.ledger);
                }
            }
            Err(err) => {
                warn!(message_id = %commit.message_id, emoji = %commit.emoji, "chat: reaction commit failed: {err}");
                if let Ok(local_id) = &local_id {
                    state.pending.fail(local_id, &mut state.ledger);
                }
                let rolled_back = state.reactions.rollback(&mut state.ledger, &commit);
                let conversation_id = state.ledger.conversation_id().cloned();
                drop(guard);
                if let (true, Some(conversation_id)) = (rolled_back, conversation_id) {
                    self.emit(ChatEvent::MessagesChanged { conversation_id });
                }
                self.emit(ChatEvent::Notice("Reaction could not be updated".to_string()));
            }
        }
    }

    /// Stamps unread messages from others in `conversation_id` as read and
    /// commits each receipt. Returns the number of receipts sent.
    pub async fn mark_visible_as_read(&self, conversation_id: &ConversationId) -> usize {
        let marked = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let unread = ReadReceiptTracker::mark_visible_as_read(
                &mut state.ledger,
                &mut state.index,
                conversation_id,
                &self.identity.user_id,
                Utc::now(),
            );
            unread
                .into_iter()
                .map(|message_id| {
                    let local_id = state.pending.begin(
                        OperationKind::MarkRead,
                        OperationPayload::MarkRead {
                            message_id: message_id.clone(),
                        },
                    );
                    (message_id, local_id)
                })
                .collect::<Vec<_>>()
        };
        if marked.is_empty() {
            return 0;
        }
        self.emit(ChatEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        self.emit(ChatEvent::ConversationsChanged);

        let results = join_all(marked.iter().map(|(message_id, _)| {
            self.api.mark_read(MarkReadRequest {
                message_id: message_id.clone(),
            })
        }))
        .await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        for ((message_id, local_id), result) in marked.iter().zip(results) {
            let Ok(local_id) = local_id else {
                continue;
            };
            match result {
                Ok(()) => {
                    state.pending.commit(local_id, None, &mut state.ledger);
                }
                Err(err) => {
                    // Receipt stays stamped locally.
                    warn!(%message_id, "chat: read receipt commit failed: {err}");
                    state.pending.fail(local_id, &mut state.ledger);
                }
            }
        }
        marked.len()
    }

    pub async fn keystroke(&self) {
        let active = self.inner.lock().await.active.clone();
        if let Some(conversation_id) = active {
            self.typing.keystroke(&conversation_id).await;
        }
    }

    pub async fn stop_typing(&self) {
        self.typing.force_stop().await;
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>, ChatError> {
        self.api
            .search_users(query)
            .await
            .map_err(ChatError::from_seam)
    }

    /// Returns the existing DIRECT conversation with `user_id`, creating it
    /// if there is none.
    pub async fn start_direct_conversation(
        &self,
        user_id: &UserId,
    ) -> Result<ConversationSummary, ChatError> {
        {
            let guard = self.inner.lock().await;
            if let Some(existing) = guard.index.sorted().iter().find(|summary| {
                summary.kind == ConversationKind::Direct
                    && summary.counterpart_id.as_ref() == Some(user_id)
            }) {
                return Ok(existing.clone());
            }
        }
        self.create_conversation(CreateConversationRequest {
            kind: ConversationKind::Direct,
            participant_ids: vec![self.identity.user_id.clone(), user_id.clone()],
            name: None,
        })
        .await
    }

    pub async fn create_group_conversation(
        &self,
        name: &str,
        members: &[UserId],
    ) -> Result<ConversationSummary, ChatError> {
        let mut participant_ids = vec![self.identity.user_id.clone()];
        participant_ids.extend(
            members
                .iter()
                .filter(|member| *member != &self.identity.user_id)
                .cloned(),
        );
        self.create_conversation(CreateConversationRequest {
            kind: ConversationKind::Group,
            participant_ids,
            name: Some(name.to_string()),
        })
        .await
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary, ChatError> {
        let record = self
            .api
            .create_conversation(request)
            .await
            .map_err(ChatError::from_seam)?;
        let summary = {
            let mut guard = self.inner.lock().await;
            // The conversation_created notice may already have inserted it.
            guard.index.upsert(&record);
            guard.index.get(&record.id).cloned()
        };
        self.emit(ChatEvent::ConversationsChanged);
        summary.ok_or(ChatError::StaleConversation(record.id))
    }

    /// Drops every subscription, ends typing and flushes pending reaction
    /// commits.
    pub async fn shutdown(&self) {
        self.router.lock().await.close_all().await;
        self.typing.force_stop().await;
        let drained = self.inner.lock().await.leave_active();
        self.commit_reactions(drained).await;
        info!(user_id = %self.identity.user_id, "chat: shut down");
    }

    async fn handle_inbound_message(&self, conversation_id: &ConversationId, message: Message) {
        let sender_name = message
            .sender_name
            .clone()
            .unwrap_or_else(|| message.sender_id.to_string());
        let preview = message.preview();
        let (outcome, typing_cleared, foreground) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.active.as_ref() != Some(conversation_id) {
                return;
            }
            let sender_id = message.sender_id.clone();
            let created_at = message.created_at;
            let outcome = state
                .ledger
                .merge_inbound(message, &self.identity.user_id);
            if outcome != MergeOutcome::Inserted {
                debug!(%conversation_id, ?outcome, "chat: inbound message not inserted");
                return;
            }
            let typing_cleared = state.typing.stop(conversation_id, &sender_id);
            state
                .index
                .bump_last_message(conversation_id, preview.clone(), created_at);
            if !state.foreground {
                state.index.increment_unread(conversation_id);
            }
            let typing_cleared = typing_cleared.then(|| state.typing.users(conversation_id));
            (outcome, typing_cleared, state.foreground)
        };
        debug!(%conversation_id, ?outcome, "chat: inbound message merged");

        self.emit(ChatEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        self.emit(ChatEvent::ConversationsChanged);
        if let Some(users) = typing_cleared {
            self.emit(ChatEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
                users,
            });
        }
        if foreground {
            self.mark_visible_as_read(conversation_id).await;
        } else {
            self.notifier.deliver(&sender_name, &preview);
        }
    }

    async fn apply_ledger_event(
        &self,
        conversation_id: &ConversationId,
        apply: impl FnOnce(&mut MessageLedger) -> bool,
    ) {
        let changed = {
            let mut guard = self.inner.lock().await;
            guard.ledger.conversation_id() == Some(conversation_id) && apply(&mut guard.ledger)
        };
        if changed {
            self.emit(ChatEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    async fn apply_typing_event(
        &self,
        conversation_id: &ConversationId,
        apply: impl FnOnce(&mut TypingRoster) -> bool,
    ) {
        let users = {
            let mut guard = self.inner.lock().await;
            if guard.active.as_ref() != Some(conversation_id) || !apply(&mut guard.typing) {
                return;
            }
            guard.typing.users(conversation_id)
        };
        self.emit(ChatEvent::TypingChanged {
            conversation_id: conversation_id.clone(),
            users,
        });
    }
}

#[async_trait]
impl EventSink for ChatClient {
    async fn on_conversation_event(&self, conversation_id: &ConversationId, event: ConversationEvent) {
        match event {
            ConversationEvent::NewMessage { message } => {
                self.handle_inbound_message(conversation_id, message).await;
            }
            ConversationEvent::ReactionAdded {
                message_id,
                emoji,
                user_id,
                user_name,
            } => {
                self.apply_ledger_event(conversation_id, |ledger| {
                    ledger.apply_reaction_added(
                        &message_id,
                        &emoji,
                        ReactionUser { user_id, user_name },
                    )
                })
                .await;
            }
            ConversationEvent::ReactionRemoved {
                message_id,
                emoji,
                user_id,
            } => {
                self.apply_ledger_event(conversation_id, |ledger| {
                    ledger.apply_reaction_removed(&message_id, &emoji, &user_id)
                })
                .await;
            }
            ConversationEvent::TypingStart { user_id, user_name } => {
                if user_id == self.identity.user_id {
                    return;
                }
                self.apply_typing_event(conversation_id, |roster| {
                    roster.start(conversation_id, TypingUser { user_id, user_name })
                })
                .await;
            }
            ConversationEvent::TypingStop { user_id } => {
                self.apply_typing_event(conversation_id, |roster| {
                    roster.stop(conversation_id, &user_id)
                })
                .await;
            }
            ConversationEvent::MessageRead {
                message_id,
                user_id,
                read_at,
            } => {
                self.apply_ledger_event(conversation_id, |ledger| {
                    ledger.record_read_receipt(&message_id, ReadReceipt { user_id, read_at })
                })
                .await;
            }
        }
    }

    async fn on_user_notice(&self, notice: UserNotice) {
        match notice {
            UserNotice::ConversationCreated { conversation } => {
                let inserted = self.inner.lock().await.index.upsert(&conversation);
                debug!(conversation_id = %conversation.id, inserted, "chat: conversation notice");
                self.emit(ChatEvent::ConversationsChanged);
            }
            UserNotice::PresenceChanged { user_id, is_online } => {
                let changed = self
                    .inner
                    .lock()
                    .await
                    .index
                    .set_presence(&user_id, is_online);
                if changed > 0 {
                    self.emit(ChatEvent::ConversationsChanged);
                }
            }
            UserNotice::IncomingCall {
                call_id,
                conversation_id,
                caller_id,
                caller_name,
                video,
            } => {
                let body = if video {
                    "Incoming video call"
                } else {
                    "Incoming call"
                };
                self.notifier.deliver(&caller_name, body);
                self.emit(ChatEvent::IncomingCall {
                    call_id,
                    conversation_id,
                    caller_id,
                    caller_name,
                    video,
                });
            }
            UserNotice::MessageNotice {
                conversation_id,
                sender_id,
                sender_name,
                preview,
                created_at,
            } => {
                if sender_id == self.identity.user_id {
                    return;
                }
                let known = {
                    let mut guard = self.inner.lock().await;
                    // The open conversation hears about it on its own channel.
                    if guard.active.as_ref() == Some(&conversation_id) {
                        return;
                    }
                    let known =
                        guard
                            .index
                            .bump_last_message(&conversation_id, preview.clone(), created_at);
                    if known {
                        guard.index.increment_unread(&conversation_id);
                    }
                    known
                };
                if known {
                    self.emit(ChatEvent::ConversationsChanged);
                    self.notifier.deliver(&sender_name, &preview);
                }
            }
        }
    }

    async fn on_lagged(&self, scope: &ChannelScope, missed: u64) {
        if let ChannelScope::Conversation(conversation_id) = scope {
            info!(%conversation_id, missed, "chat: refetching after lag");
            if let Err(err) = self.refresh_messages().await {
                warn!(%conversation_id, "chat: refetch after lag failed: {err}");
            }
        }
    }

    async fn on_closed(&self, scope: &ChannelScope) {
        warn!(%scope, "chat: realtime channel closed");
        self.emit(ChatEvent::Notice("Realtime connection lost".to_string()));
        if let ChannelScope::Conversation(conversation_id) = scope {
            if self.active_conversation().await.as_ref() != Some(conversation_id) {
                return;
            }
            if let Err(err) = self.refresh_messages().await {
                warn!(%conversation_id, "chat: refetch after close failed: {err}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
