//! Subscription bookkeeping and frame decoding for realtime channels.
//!
//! The router owns at most one conversation subscription and one user
//! subscription. Decoded events go to an [`EventSink`] untouched.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationEvent, UserNotice},
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::DecodeError,
    transport::{ChannelScope, RealtimeTransport},
    typing::TypingBroadcaster,
};

pub fn decode_conversation_event(frame: &str) -> Result<ConversationEvent, DecodeError> {
    Ok(serde_json::from_str(frame)?)
}

pub fn decode_user_notice(frame: &str) -> Result<UserNotice, DecodeError> {
    Ok(serde_json::from_str(frame)?)
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_conversation_event(&self, conversation_id: &ConversationId, event: ConversationEvent);
    async fn on_user_notice(&self, notice: UserNotice);
    /// Frames were dropped because the listener fell behind.
    async fn on_lagged(&self, _scope: &ChannelScope, _missed: u64) {}
    /// The transport ended the channel; no more frames will arrive on it.
    async fn on_closed(&self, _scope: &ChannelScope) {}
}

struct Subscription {
    scope: ChannelScope,
    listener: JoinHandle<()>,
}

pub struct RealtimeEventRouter {
    transport: Arc<dyn RealtimeTransport>,
    typing: TypingBroadcaster,
    conversation: Option<Subscription>,
    user: Option<Subscription>,
}

impl RealtimeEventRouter {
    pub fn new(transport: Arc<dyn RealtimeTransport>, typing: TypingBroadcaster) -> Self {
        Self {
            transport,
            typing,
            conversation: None,
            user: None,
        }
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        match self.conversation.as_ref().map(|subscription| &subscription.scope) {
            Some(ChannelScope::Conversation(id)) => Some(id),
            _ => None,
        }
    }

    /// Replaces the current conversation subscription.
    pub async fn open_conversation(
        &mut self,
        conversation_id: &ConversationId,
        sink: Arc<dyn EventSink>,
    ) -> Result<()> {
        self.close_conversation().await;
        let scope = ChannelScope::Conversation(conversation_id.clone());
        let frames = self.transport.subscribe(&scope).await?;
        info!(%scope, "realtime: subscribed");
        self.conversation = Some(Subscription {
            listener: spawn_listener(scope.clone(), frames, sink),
            scope,
        });
        Ok(())
    }

    /// Tears down the conversation subscription and ends any local typing
    /// session. Safe to call when nothing is open.
    pub async fn close_conversation(&mut self) -> bool {
        let Some(subscription) = self.conversation.take() else {
            return false;
        };
        self.typing.force_stop().await;
        self.teardown(subscription).await;
        true
    }

    pub async fn open_user(&mut self, user_id: &UserId, sink: Arc<dyn EventSink>) -> Result<()> {
        if let Some(previous) = self.user.take() {
            self.teardown(previous).await;
        }
        let scope = ChannelScope::User(user_id.clone());
        let frames = self.transport.subscribe(&scope).await?;
        info!(%scope, "realtime: subscribed");
        self.user = Some(Subscription {
            listener: spawn_listener(scope.clone(), frames, sink),
            scope,
        });
        Ok(())
    }

    pub async fn close_all(&mut self) {
        self.close_conversation().await;
        if let Some(subscription) = self.user.take() {
            self.teardown(subscription).await;
        }
    }

    async fn teardown(&self, subscription: Subscription) {
        subscription.listener.abort();
        if let Err(err) = self.transport.unsubscribe(&subscription.scope).await {
            warn!(scope = %subscription.scope, "realtime: unsubscribe failed: {err}");
        }
        info!(scope = %subscription.scope, "realtime: unsubscribed");
    }
}

fn spawn_listener(
    scope: ChannelScope,
    mut frames: broadcast::Receiver<String>,
    sink: Arc<dyn EventSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => dispatch(&scope, &frame, sink.as_ref()).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(%scope, missed, "realtime: listener lagged");
                    sink.on_lagged(&scope, missed).await;
                }
                Err(RecvError::Closed) => {
                    debug!(%scope, "realtime: channel closed");
                    sink.on_closed(&scope).await;
                    break;
                }
            }
        }
    })
}

async fn dispatch(scope: &ChannelScope, frame: &str, sink: &dyn EventSink) {
    match scope {
        ChannelScope::Conversation(conversation_id) => match decode_conversation_event(frame) {
            Ok(event) => sink.on_conversation_event(conversation_id, event).await,
            Err(err) => warn!(%scope, "realtime: dropping frame: {err}"),
        },
        ChannelScope::User(_) => match decode_user_notice(frame) {
            Ok(notice) => sink.on_user_notice(notice).await,
            Err(err) => warn!(%scope, "realtime: dropping frame: {err}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;
    use crate::{transport::MemoryTransport, typing::TypingUser};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(ConversationId, ConversationEvent)>>,
        notices: Mutex<Vec<UserNotice>>,
        closed: Mutex<Vec<ChannelScope>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn on_conversation_event(
            &self,
            conversation_id: &ConversationId,
            event: ConversationEvent,
        ) {
            self.events
                .lock()
                .await
                .push((conversation_id.clone(), event));
        }

        async fn on_user_notice(&self, notice: UserNotice) {
            self.notices.lock().await.push(notice);
        }

        async fn on_closed(&self, scope: &ChannelScope) {
            self.closed.lock().await.push(scope.clone());
        }
    }

    fn router(transport: &Arc<MemoryTransport>) -> RealtimeEventRouter {
        let typing = TypingBroadcaster::new(
            transport.clone(),
            TypingUser {
                user_id: UserId::from("me"),
                user_name: "Me".to_string(),
            },
            Duration::from_secs(3),
        );
        RealtimeEventRouter::new(transport.clone(), typing)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_closing_the_subscription() {
        let transport = MemoryTransport::new(16);
        let mut router = router(&transport);
        let sink = Arc::new(RecordingSink::default());
        let conversation = ConversationId::from("c-1");
        let scope = ChannelScope::Conversation(conversation.clone());

        router
            .open_conversation(&conversation, sink.clone())
            .await
            .expect("open");
        transport.inject(&scope, "{not json").expect("inject");
        transport
            .inject(&scope, r#"{"type":"no_such_event","payload":{}}"#)
            .expect("inject");
        transport
            .inject(&scope, r#"{"type":"typing_stop","payload":{"userId":"u-2"}}"#)
            .expect("inject");
        settle().await;

        let events = sink.events.lock().await;
        assert_eq!(
            *events,
            vec![(
                conversation.clone(),
                ConversationEvent::TypingStop {
                    user_id: UserId::from("u-2")
                }
            )]
        );
    }

    #[tokio::test]
    async fn user_notices_are_routed_from_the_user_channel() {
        let transport = MemoryTransport::new(16);
        let mut router = router(&transport);
        let sink = Arc::new(RecordingSink::default());
        let me = UserId::from("me");

        router.open_user(&me, sink.clone()).await.expect("open");
        transport
            .inject(
                &ChannelScope::User(me),
                r#"{"type":"presence_changed","payload":{"userId":"u-2","isOnline":true}}"#,
            )
            .expect("inject");
        settle().await;

        assert_eq!(
            *sink.notices.lock().await,
            vec![UserNotice::PresenceChanged {
                user_id: UserId::from("u-2"),
                is_online: true
            }]
        );
    }

    #[tokio::test]
    async fn closing_twice_is_harmless_and_stops_typing() {
        let transport = MemoryTransport::new(16);
        let mut router = router(&transport);
        let sink = Arc::new(RecordingSink::default());
        let conversation = ConversationId::from("c-1");

        router
            .open_conversation(&conversation, sink)
            .await
            .expect("open");
        router.typing.keystroke(&conversation).await;

        assert!(router.close_conversation().await);
        assert!(!router.close_conversation().await);
        assert!(router.active_conversation().is_none());

        let stops = transport
            .published()
            .into_iter()
            .filter(|(_, event)| matches!(event, ConversationEvent::TypingStop { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn switching_conversations_detaches_the_old_listener() {
        let transport = MemoryTransport::new(16);
        let mut router = router(&transport);
        let sink = Arc::new(RecordingSink::default());
        let first = ConversationId::from("c-1");

        router
            .open_conversation(&first, sink.clone())
            .await
            .expect("open");
        router
            .open_conversation(&ConversationId::from("c-2"), sink.clone())
            .await
            .expect("open");
        settle().await;

        transport
            .inject(
                &ChannelScope::Conversation(first),
                r#"{"type":"typing_stop","payload":{"userId":"u-2"}}"#,
            )
            .expect("inject");
        settle().await;

        assert!(sink.events.lock().await.is_empty());
        assert_eq!(
            router.active_conversation(),
            Some(&ConversationId::from("c-2"))
        );
    }

    #[tokio::test]
    async fn transport_side_close_is_reported_once() {
        let transport = MemoryTransport::new(16);
        let mut router = router(&transport);
        let sink = Arc::new(RecordingSink::default());
        let conversation = ConversationId::from("c-1");
        let scope = ChannelScope::Conversation(conversation.clone());

        router
            .open_conversation(&conversation, sink.clone())
            .await
            .expect("open");
        transport.unsubscribe(&scope).await.expect("drop channel");
        settle().await;

        assert_eq!(*sink.closed.lock().await, vec![scope]);
        router.close_conversation().await;
        settle().await;
        assert_eq!(sink.closed.lock().await.len(), 1);
    }
}
