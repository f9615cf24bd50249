use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{
    http::HttpChatApi, load_settings, ws::WsRealtimeTransport, ChatClient, ChatError, ChatEvent,
    LocalIdentity,
};
use shared::domain::{ConversationId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from chat.toml / environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_name: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Conversation to open after listing.
    #[arg(long)]
    conversation: Option<String>,
    /// Text to send into `--conversation`.
    #[arg(long)]
    send: Option<String>,
    /// Keep printing realtime events for this many seconds.
    #[arg(long, default_value_t = 0)]
    watch_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let api = Arc::new(HttpChatApi::new(settings.server_url.clone(), args.token));
    let transport = Arc::new(WsRealtimeTransport::new(
        settings.realtime_base_url()?,
        settings.event_buffer,
    ));
    let identity = LocalIdentity {
        user_name: args.user_name.unwrap_or_else(|| args.user_id.clone()),
        user_id: UserId::from(args.user_id.as_str()),
    };
    let client = ChatClient::new(identity, &settings, api, transport);
    let mut events = client.subscribe_events();

    if let Err(err) = client.connect_user_channel().await {
        warn!("user channel unavailable: {err}");
    }
    client.load_conversations().await?;
    for summary in client.conversations().await {
        println!(
            "{}\t{}\tunread={}\t{}",
            summary.id,
            summary.display_name,
            summary.unread_count,
            summary.last_message.unwrap_or_default()
        );
    }

    if let Some(conversation) = args.conversation {
        client
            .open_conversation(&ConversationId::from(conversation.as_str()))
            .await?;
        for message in client.messages().await {
            println!(
                "[{}] {}: {}",
                message.created_at.to_rfc3339(),
                message
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| message.sender_id.to_string()),
                message.preview()
            );
        }

        if let Some(text) = args.send {
            match client.send_text(&text).await {
                Ok(confirmed) => println!("sent {}", confirmed.id),
                Err(ChatError::SendRejected { restored, reason }) => {
                    eprintln!("not sent ({reason}); draft kept: {}", restored.content);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    if args.watch_secs > 0 {
        let deadline = tokio::time::sleep(Duration::from_secs(args.watch_secs));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(event) => print_event(&client, event).await,
                    Err(RecvError::Lagged(missed)) => warn!(missed, "event printer lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn print_event(client: &ChatClient, event: ChatEvent) {
    match event {
        ChatEvent::MessagesChanged { conversation_id } => {
            if let Some(last) = client.messages().await.last() {
                println!("{conversation_id}: {}", last.preview());
            }
        }
        ChatEvent::ConversationsChanged => {}
        ChatEvent::TypingChanged {
            conversation_id,
            users,
        } => {
            let names: Vec<&str> = users.iter().map(|user| user.user_name.as_str()).collect();
            println!("{conversation_id}: typing [{}]", names.join(", "));
        }
        ChatEvent::SendFailed { reason, .. } => println!("send failed: {reason}"),
        ChatEvent::Notice(notice) => println!("notice: {notice}"),
        ChatEvent::IncomingCall {
            caller_name, video, ..
        } => println!(
            "incoming {} call from {caller_name}",
            if video { "video" } else { "voice" }
        ),
    }
}
