//! Seams to the backing store, the publish/subscribe transport and the
//! platform notification service.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{
        ConversationEvent, ConversationRecord, CreateConversationRequest, CreateMessageRequest,
        MarkReadRequest, Message, SetReactionRequest, UserSearchResult,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>>;
    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;
    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message>;
    async fn set_reaction(&self, request: SetReactionRequest) -> Result<()>;
    async fn mark_read(&self, request: MarkReadRequest) -> Result<()>;
    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>>;
    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationRecord>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    Conversation(ConversationId),
    User(UserId),
}

impl fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Publish/subscribe transport. Delivery may be duplicated or reordered.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Raw text frames published on `scope`.
    async fn subscribe(&self, scope: &ChannelScope) -> Result<broadcast::Receiver<String>>;
    async fn unsubscribe(&self, scope: &ChannelScope) -> Result<()>;
    async fn publish(&self, scope: &ChannelScope, event: &ConversationEvent) -> Result<()>;
}

pub trait Notifier: Send + Sync {
    fn deliver(&self, title: &str, body: &str);
}

/// Writes notifications to the log; used when no platform service is wired.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn deliver(&self, title: &str, body: &str) {
        info!(title, body, "local notification");
    }
}

/// In-process loopback transport. Every publish is delivered to all current
/// subscribers of the scope, the publisher included.
pub struct MemoryTransport {
    capacity: usize,
    channels: Mutex<HashMap<ChannelScope, broadcast::Sender<String>>>,
    published: Mutex<Vec<(ChannelScope, ConversationEvent)>>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    fn sender(&self, scope: &ChannelScope) -> Result<broadcast::Sender<String>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| anyhow!("memory transport lock poisoned"))?;
        Ok(channels
            .entry(scope.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }

    /// Delivers a raw frame as if the server had published it. Returns the
    /// number of subscribers reached.
    pub fn inject(&self, scope: &ChannelScope, frame: impl Into<String>) -> Result<usize> {
        Ok(self.sender(scope)?.send(frame.into()).unwrap_or(0))
    }

    /// Events published through this transport, oldest first.
    pub fn published(&self) -> Vec<(ChannelScope, ConversationEvent)> {
        self.published
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, scope: &ChannelScope) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(scope).map(|sender| sender.receiver_count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn subscribe(&self, scope: &ChannelScope) -> Result<broadcast::Receiver<String>> {
        debug!(%scope, "memory transport: subscribe");
        Ok(self.sender(scope)?.subscribe())
    }

    async fn unsubscribe(&self, scope: &ChannelScope) -> Result<()> {
        debug!(%scope, "memory transport: unsubscribe");
        self.channels
            .lock()
            .map_err(|_| anyhow!("memory transport lock poisoned"))?
            .remove(scope);
        Ok(())
    }

    async fn publish(&self, scope: &ChannelScope, event: &ConversationEvent) -> Result<()> {
        let frame = serde_json::to_string(event)?;
        if let Ok(mut log) = self.published.lock() {
            log.push((scope.clone(), event.clone()));
        }
        let _ = self.sender(scope)?.send(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_transport_loops_published_events_back() {
        let transport = MemoryTransport::new(8);
        let scope = ChannelScope::Conversation(ConversationId::from("c-1"));
        let mut frames = transport.subscribe(&scope).await.expect("subscribe");

        let event = ConversationEvent::TypingStop {
            user_id: UserId::from("u-1"),
        };
        transport.publish(&scope, &event).await.expect("publish");

        let frame = frames.recv().await.expect("frame");
        let decoded: ConversationEvent = serde_json::from_str(&frame).expect("json");
        assert_eq!(decoded, event);
        assert_eq!(transport.published(), vec![(scope, event)]);
    }

    #[test]
    fn scopes_render_as_channel_names() {
        assert_eq!(
            ChannelScope::Conversation(ConversationId::from("c-7")).to_string(),
            "conversation:c-7"
        );
        assert_eq!(ChannelScope::User(UserId::from("u-1")).to_string(), "user:u-1");
    }
}
