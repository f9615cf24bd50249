//! `RealtimeTransport` over WebSockets: one socket per subscribed channel,
//! JSON text frames in both directions.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::ConversationEvent;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::transport::{ChannelScope, RealtimeTransport};

struct WsChannel {
    id: u64,
    frames: broadcast::Sender<String>,
    outbound: mpsc::UnboundedSender<String>,
    pump: JoinHandle<()>,
}

pub struct WsRealtimeTransport {
    base_url: String,
    capacity: usize,
    next_id: AtomicU64,
    channels: Arc<Mutex<HashMap<ChannelScope, WsChannel>>>,
}

impl WsRealtimeTransport {
    /// `base_url` is a `ws://` or `wss://` origin; channels live under
    /// `/realtime?channel=<scope>`.
    pub fn new(base_url: impl Into<String>, capacity: usize) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn channel_url(&self, scope: &ChannelScope) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/realtime", self.base_url))
            .with_context(|| format!("invalid realtime url: {}", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("channel", &scope.to_string());
        Ok(url)
    }

    async fn connect(&self, scope: &ChannelScope) -> Result<WsChannel> {
        let url = self.channel_url(scope)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut writer, mut reader) = stream.split();
        let (frames, _) = broadcast::channel(self.capacity);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inbound = frames.clone();
        let registry = Arc::clone(&self.channels);
        let scope = scope.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = reader.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let _ = inbound.send(text);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(%scope, "websocket receive failed: {err}");
                            break;
                        }
                    },
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(err) = writer.send(Message::Text(text)).await {
                                warn!(%scope, "websocket send failed: {err}");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = writer.close().await;
            drop(inbound);
            // Last sender goes with the entry, so listeners observe `Closed`.
            let mut channels = registry.lock().await;
            if channels.get(&scope).is_some_and(|channel| channel.id == id) {
                channels.remove(&scope);
            }
            debug!(%scope, "websocket pump finished");
        });

        Ok(WsChannel {
            id,
            frames,
            outbound,
            pump,
        })
    }
}

#[async_trait]
impl RealtimeTransport for WsRealtimeTransport {
    async fn subscribe(&self, scope: &ChannelScope) -> Result<broadcast::Receiver<String>> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(scope) {
            if !channel.pump.is_finished() {
                return Ok(channel.frames.subscribe());
            }
        }
        let channel = self.connect(scope).await?;
        let receiver = channel.frames.subscribe();
        if let Some(stale) = channels.insert(scope.clone(), channel) {
            stale.pump.abort();
        }
        Ok(receiver)
    }

    async fn unsubscribe(&self, scope: &ChannelScope) -> Result<()> {
        if let Some(channel) = self.channels.lock().await.remove(scope) {
            // Dropping the sender lets the pump close the socket cleanly.
            drop(channel.outbound);
        }
        Ok(())
    }

    async fn publish(&self, scope: &ChannelScope, event: &ConversationEvent) -> Result<()> {
        let frame = serde_json::to_string(event)?;
        let channels = self.channels.lock().await;
        let channel = channels
            .get(scope)
            .ok_or_else(|| anyhow!("not subscribed to {scope}"))?;
        channel
            .outbound
            .send(frame)
            .map_err(|_| anyhow!("websocket for {scope} is closed"))
    }
}

impl Drop for WsRealtimeTransport {
    fn drop(&mut self) {
        if let Ok(channels) = self.channels.try_lock() {
            for channel in channels.values() {
                channel.pump.abort();
            }
        }
    }
}
