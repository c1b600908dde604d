//! Tidewire line-mode client.
//!
//! # Usage
//!
//! ```bash
//! # Join a room and chat from stdin
//! TIDEWIRE_SESSION_KEY=abc tidewire --room lobby
//!
//! # Point at another server, with a config file for timings
//! tidewire --socket-url https://chat.example --api-url https://chat.example/api \
//!     --config tidewire.json
//! ```
//!
//! Plain lines are sent to the current conversation. `/join <room>`,
//! `/dm <thread>`, `/history`, `/read` and `/quit` are commands. All output
//! goes through `tracing`; set `RUST_LOG` to change verbosity.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use clap::Parser;
use tidewire_client::{
    ClientConfig, Command, ConversationKey, MediaRefs, Runtime, RuntimeHandle, RuntimeStopped,
    SystemEnv, http::HttpApi, transport::WsChannel,
};
use tidewire_core::{ChannelStatus, OutboundAction};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tidewire chat client
#[derive(Parser, Debug)]
#[command(name = "tidewire")]
#[command(about = "Headless client for a tidewire chat server")]
#[command(version)]
struct Args {
    /// Realtime endpoint (http(s):// or ws(s)://)
    #[arg(long, env = "TIDEWIRE_SOCKET_URL")]
    socket_url: Option<String>,

    /// REST base URL
    #[arg(long, env = "TIDEWIRE_API_URL")]
    api_url: Option<String>,

    /// Session credential sent with the handshake and REST calls
    #[arg(long, env = "TIDEWIRE_SESSION_KEY")]
    session_key: Option<String>,

    /// Room to join on startup
    #[arg(short, long)]
    room: Option<String>,

    /// JSON config file; missing or invalid files fall back to defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Say(String),
    JoinRoom(String),
    OpenThread(String),
    History,
    MarkRead,
    Quit,
    Empty,
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Say(line.to_string());
        };

        let (name, arg) = command.split_once(' ').map_or((command, ""), |(n, a)| (n, a.trim()));
        match (name, arg) {
            ("join", room) if !room.is_empty() => Self::JoinRoom(room.to_string()),
            ("dm", thread) if !thread.is_empty() => Self::OpenThread(thread.to_string()),
            ("history", _) => Self::History,
            ("read", _) => Self::MarkRead,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Say(line.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = args.config.as_ref().map(ClientConfig::load).unwrap_or_default();
    if let Some(url) = args.socket_url {
        config.socket_url = url;
    }
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }

    tracing::info!(socket = %config.socket_url, api = %config.api_base_url, "tidewire starting");

    let channel = Arc::new(WsChannel::new());
    let rest = Arc::new(HttpApi::new(config.api_base_url.clone(), args.session_key.clone()));
    let (runtime, handle, mut alerts) =
        Runtime::new(SystemEnv::new(), channel, rest, &config, args.session_key);
    let runtime = tokio::spawn(runtime.run());

    let last_status = Mutex::new(ChannelStatus::Idle);
    let _subscription = handle.store().subscribe(move |snapshot| {
        let mut last = last_status.lock().unwrap_or_else(PoisonError::into_inner);
        if *last != snapshot.channel_status {
            tracing::info!(status = ?snapshot.channel_status, "channel");
            *last = snapshot.channel_status;
        }
    });

    tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            let body = alert.body.as_deref().unwrap_or_default();
            tracing::info!(title = %alert.title, body, "alert");
        }
    });

    let mut current = None;
    if let Some(room) = args.room {
        current = join_room(&handle, room).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Input::parse(&line) {
            Input::Empty => {},
            Input::Quit => break,
            Input::JoinRoom(room) => current = join_room(&handle, room).await.or(current),
            Input::OpenThread(thread) => {
                let conversation = ConversationKey::direct(thread);
                focus(&handle, &conversation).await?;
                current = Some(conversation);
            },
            Input::History => match &current {
                Some(conversation) => {
                    handle.command(Command::LoadHistory(conversation.clone())).await?;
                },
                None => tracing::warn!("no conversation selected"),
            },
            Input::MarkRead => handle.command(Command::MarkNotificationsRead).await?,
            Input::Say(text) => {
                let Some(conversation) = current.clone() else {
                    tracing::warn!("no conversation selected, try /join <room>");
                    continue;
                };
                let report = handle.send(conversation, text, MediaRefs::default()).await?;
                match report.error {
                    Some(err) => tracing::warn!(local_id = %report.local_id, %err, "not sent"),
                    None => {
                        tracing::info!(local_id = %report.local_id, state = ?report.state, "sent");
                    },
                }
            },
        }

        if let Some(conversation) = &current {
            let snapshot = handle.store().snapshot();
            if let Some(message) = snapshot.messages(conversation).last() {
                tracing::debug!(
                    id = %message.id,
                    from = message.sender_id.as_deref().unwrap_or("?"),
                    text = %message.text,
                    "latest"
                );
            }
        }
    }

    handle.command(Command::Shutdown).await?;
    runtime.await?;
    Ok(())
}

async fn join_room(handle: &RuntimeHandle, room: String) -> Option<ConversationKey> {
    match handle.request(OutboundAction::JoinRoom { room_id: room.clone() }).await {
        Ok(_) => tracing::info!(%room, "joined"),
        // The channel may still be opening; the room is usable via REST
        Err(err) => tracing::warn!(%room, %err, "join not acknowledged"),
    }
    let conversation = ConversationKey::room(room);
    focus(handle, &conversation).await.ok()?;
    handle.command(Command::LoadHistory(conversation.clone())).await.ok()?;
    Some(conversation)
}

async fn focus(
    handle: &RuntimeHandle,
    conversation: &ConversationKey,
) -> Result<(), RuntimeStopped> {
    handle.command(Command::Focus { conversation: Some(conversation.clone()), peer: None }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_said() {
        assert_eq!(Input::parse("  hello  "), Input::Say("hello".into()));
        assert_eq!(Input::parse(""), Input::Empty);
    }

    #[test]
    fn commands_parse() {
        assert_eq!(Input::parse("/join lobby"), Input::JoinRoom("lobby".into()));
        assert_eq!(Input::parse("/dm t-42"), Input::OpenThread("t-42".into()));
        assert_eq!(Input::parse("/history"), Input::History);
        assert_eq!(Input::parse("/read"), Input::MarkRead);
        assert_eq!(Input::parse("/exit"), Input::Quit);
    }

    #[test]
    fn incomplete_command_is_sent_as_text() {
        assert_eq!(Input::parse("/join"), Input::Say("/join".into()));
        assert_eq!(Input::parse("/shrug"), Input::Say("/shrug".into()));
    }
}
