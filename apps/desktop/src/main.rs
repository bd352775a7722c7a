mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    cursor::LoadOlderOutcome, types::Conversation, ChatClient, ClientEvent,
};
use shared::{
    domain::{ConversationId, UserId},
    protocol::MessagePayload,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the marketplace chat backend")]
struct Args {
    /// TOML settings file; `chat.toml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    page_limit: Option<u32>,
    /// Conversation to open right after the list is loaded.
    #[arg(long)]
    open: Option<String>,
}

const HELP: &str = "\
commands:
  /list           refresh and print conversations
  /open <id>      view a conversation
  /start <user>   start a direct chat with a user and view it
  /older          load older messages of the viewed conversation
  /close          stop viewing the current conversation
  /quit           exit
anything else is sent to the viewed conversation";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(args.config.as_deref())?;
    if let Some(v) = args.api_url {
        settings.api_base_url = v;
    }
    if let Some(v) = args.push_url {
        settings.push_base_url = Some(v);
    }
    if let Some(v) = args.token {
        settings.auth_token = v;
    }
    if let Some(v) = args.user_id {
        settings.self_id = v;
    }
    if let Some(v) = args.page_limit {
        settings.page_limit = v;
    }

    let client = ChatClient::new(settings.into_client_options()?);
    let printer = tokio::spawn(print_events(Arc::clone(&client)));

    match client.refresh_conversations().await {
        Ok(list) => print_conversations(&list),
        Err(err) => warn!("initial conversation list failed: {err}"),
    }
    if let Some(id) = args.open {
        open(&client, ConversationId::from(id)).await;
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/help", _) => println!("{HELP}"),
            ("/list", _) => {
                if let Ok(list) = client.refresh_conversations().await {
                    print_conversations(&list);
                }
            }
            ("/open", id) if !id.trim().is_empty() => {
                open(&client, ConversationId::from(id.trim())).await;
            }
            ("/start", peer) if !peer.trim().is_empty() => {
                if let Ok(conversation) = client
                    .start_conversation(&UserId::from(peer.trim()))
                    .await
                {
                    open(&client, conversation.id).await;
                }
            }
            ("/older", _) => older(&client).await,
            ("/close", _) => client.close_conversation().await,
            _ => {
                let Some(id) = client.active_conversation().await else {
                    println!("open a conversation first (/open <id>)");
                    continue;
                };
                let _ = client.send(&id, line).await;
            }
        }
    }

    client.close_conversation().await;
    printer.abort();
    Ok(())
}

async fn open(client: &Arc<ChatClient>, id: ConversationId) {
    if let Ok(messages) = client.open_conversation(&id).await {
        println!("--- conversation {id} ---");
        for message in messages.iter().rev() {
            print_message(message);
        }
    }
}

async fn older(client: &Arc<ChatClient>) {
    let Some(id) = client.active_conversation().await else {
        println!("no conversation open");
        return;
    };
    match client.load_older(&id).await {
        Ok(LoadOlderOutcome::Merged { added, exhausted }) => {
            println!("loaded {added} older messages{}", if exhausted { " (start of history)" } else { "" });
        }
        Ok(LoadOlderOutcome::Skipped) => println!("no older messages"),
        Err(_) => {}
    }
}

async fn print_events(client: Arc<ChatClient>) {
    let mut events = BroadcastStream::new(client.subscribe_events());
    while let Some(event) = events.next().await {
        let Ok(event) = event else {
            continue;
        };
        match event {
            ClientEvent::MessageReceived { message, .. } => print_message(&message),
            ClientEvent::MessageSent { message, .. } => print_message(&message),
            ClientEvent::ConversationUpdated(conversation) => {
                if conversation.unread_count > 0 {
                    println!("* {} has {} unread", conversation.id, conversation.unread_count);
                }
            }
            ClientEvent::ReadReceipt { receipt, .. } => {
                if let Some(message_id) = receipt.message_id {
                    println!("* seen up to {message_id}");
                }
            }
            ClientEvent::ChannelOpened { conversation_id } => {
                println!("* live updates on for {conversation_id}");
            }
            ClientEvent::ChannelClosed { conversation_id, code } => {
                println!("* live updates interrupted for {conversation_id} (code {code:?}); reconnecting");
            }
            ClientEvent::Error(err) => println!("! {err}"),
            ClientEvent::ConversationsRefreshed(_) => {}
        }
    }
}

fn print_conversations(list: &[Conversation]) {
    if list.is_empty() {
        println!("no conversations");
        return;
    }
    for conversation in list {
        let title = conversation
            .listing_title
            .as_deref()
            .or_else(|| {
                conversation
                    .other_participant
                    .as_ref()
                    .and_then(|p| p.display_name.as_deref())
            })
            .unwrap_or("(untitled)");
        let preview = conversation
            .last_message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        println!(
            "{:>8}  {:<24} {:>3} unread  {}",
            conversation.id.as_str(),
            title,
            conversation.unread_count,
            preview
        );
    }
}

fn print_message(message: &MessagePayload) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.sender_id,
        message.content
    );
}
