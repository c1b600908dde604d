//! Async runtime driving the sans-IO client.
//!
//! The [`Runtime`] owns the [`Client`] and the I/O seams and runs one event
//! loop that selects over:
//! - [`ChannelEvent`]s reported by the channel
//! - a tick interval for connection and typing timers
//! - [`Command`]s from the UI side, sent through a [`RuntimeHandle`]
//!
//! Sends and other ack-bearing requests are spawned onto their own tasks so a
//! slow ack never stalls inbound processing. Alerts leave through a bounded
//! channel; a full channel drops the alert rather than blocking the loop.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tidewire_core::{
    Ack, Alert, ConversationKey, Environment, MediaRefs, OutboundAction, SendError, Store,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};

use crate::{
    channel::{Channel, ChannelEvent, OpenRequest, RestApi},
    client::Client,
    config::ClientConfig,
    event::{ClientAction, ClientEvent},
    outbox::{Outbox, SendReport},
};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const ALERT_CAPACITY: usize = 32;

/// The runtime has shut down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("runtime stopped")]
pub struct RuntimeStopped;

/// Request from the UI side.
#[derive(Debug)]
pub enum Command {
    /// Send a message
    Send {
        /// Target conversation
        conversation: ConversationKey,
        /// Message text
        text: String,
        /// Attached media references
        media: MediaRefs,
        /// Receives the outcome
        reply: oneshot::Sender<SendReport>,
    },
    /// Emit another ack-bearing action
    Request {
        /// Action to emit
        action: OutboundAction,
        /// Receives the ack
        reply: oneshot::Sender<Result<Ack, SendError>>,
    },
    /// The view moved to another conversation
    Focus {
        /// Conversation on screen
        conversation: Option<ConversationKey>,
        /// Peer of a direct thread
        peer: Option<String>,
    },
    /// Composer text changed
    Typing {
        /// Room being typed in
        room_id: String,
        /// Current composer text
        text: String,
    },
    /// Document visibility changed
    Visibility(bool),
    /// New handshake credential
    Credential(Option<String>),
    /// Fetch recent history of a conversation
    LoadHistory(ConversationKey),
    /// Mark every notification read
    MarkNotificationsRead,
    /// Tear down the channel (logout)
    Reset,
    /// Stop the runtime
    Shutdown,
}

/// Cloneable front end of a running [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<Command>,
    store: Store,
}

impl RuntimeHandle {
    /// Store for snapshot reads and subscriptions.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Send a message and wait for the outcome.
    ///
    /// # Errors
    ///
    /// - `RuntimeStopped` if the runtime exited before answering
    pub async fn send(
        &self,
        conversation: ConversationKey,
        text: impl Into<String>,
        media: MediaRefs,
    ) -> Result<SendReport, RuntimeStopped> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { conversation, text: text.into(), media, reply }).await?;
        rx.await.map_err(|_| RuntimeStopped)
    }

    /// Emit an ack-bearing action and wait for the ack.
    ///
    /// # Errors
    ///
    /// - `SendError::ChannelUnavailable` if the runtime is gone
    /// - Anything [`Outbox::request`] reports
    pub async fn request(&self, action: OutboundAction) -> Result<Ack, SendError> {
        let (reply, rx) = oneshot::channel();
        let stopped = || SendError::ChannelUnavailable(RuntimeStopped.to_string());
        self.command(Command::Request { action, reply }).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Queue a command.
    ///
    /// # Errors
    ///
    /// - `RuntimeStopped` if the runtime exited
    pub async fn command(&self, command: Command) -> Result<(), RuntimeStopped> {
        self.commands.send(command).await.map_err(|_| RuntimeStopped)
    }
}

/// Event loop owning the client and its I/O.
pub struct Runtime<E: Environment, C, R> {
    env: E,
    client: Client<E>,
    channel: Arc<C>,
    rest: Arc<R>,
    outbox: Outbox<E, C, R>,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: mpsc::Receiver<ChannelEvent>,
    commands: mpsc::Receiver<Command>,
    alerts: mpsc::Sender<Alert>,
    tick_interval: Duration,
    history_limit: usize,
}

impl<E, C, R> Runtime<E, C, R>
where
    E: Environment,
    C: Channel,
    R: RestApi,
{
    /// Build a runtime plus the handle and alert stream the UI holds.
    ///
    /// `credential` goes to both the channel handshake and `rest`.
    pub fn new(
        env: E,
        channel: Arc<C>,
        rest: Arc<R>,
        config: &ClientConfig,
        credential: Option<String>,
    ) -> (Self, RuntimeHandle, mpsc::Receiver<Alert>) {
        rest.set_credential(credential.clone());
        let client = Client::new(env.clone(), config, credential);
        let outbox = Outbox::new(
            env.clone(),
            Arc::clone(&channel),
            Arc::clone(&rest),
            client.reconciler().clone(),
            config.ack_timeout(),
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (alerts, alerts_rx) = mpsc::channel(ALERT_CAPACITY);
        let handle = RuntimeHandle { commands: commands_tx, store: client.store().clone() };

        let runtime = Self {
            env,
            client,
            channel,
            rest,
            outbox,
            events_tx,
            events_rx,
            commands,
            alerts,
            tick_interval: config.tick_interval(),
            history_limit: config.history_limit,
        };
        (runtime, handle, alerts_rx)
    }

    /// Run until [`Command::Shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        let actions = self.client.handle(ClientEvent::Connect);
        self.execute(actions);

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    let event = match event {
                        ChannelEvent::Transport { open_id, event } => {
                            ClientEvent::Transport { open_id, event }
                        },
                        ChannelEvent::Inbound { name, data } => ClientEvent::Inbound { name, data },
                    };
                    let actions = self.client.handle(event);
                    self.execute(actions);
                },
                _ = ticker.tick() => {
                    let now = self.env.now();
                    let transport_connected = self.channel.is_connected();
                    let tick = ClientEvent::Tick { now, transport_connected };
                    let actions = self.client.handle(tick);
                    self.execute(actions);
                },
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        tracing::info!("runtime stopped");
        self.channel.close("shutdown");
    }

    fn handle_command(&mut self, command: Command) {
        let event = match command {
            Command::Send { conversation, text, media, reply } => {
                if let ConversationKey::Room(room_id) = &conversation {
                    let actions = self.client.stop_typing(room_id);
                    self.execute(actions);
                }
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let report = outbox.send(conversation, text, media).await;
                    // Caller may have stopped waiting
                    let _ = reply.send(report);
                });
                return;
            },
            Command::Request { action, reply } => {
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let _ = reply.send(outbox.request(&action).await);
                });
                return;
            },
            Command::LoadHistory(conversation) => {
                let outbox = self.outbox.clone();
                let limit = self.history_limit;
                tokio::spawn(async move {
                    if let Err(err) = outbox.fetch_history(&conversation, limit).await {
                        tracing::warn!(%conversation, %err, "history fetch failed");
                    }
                });
                return;
            },
            Command::Focus { conversation, peer } => ClientEvent::Focus { conversation, peer },
            Command::Typing { room_id, text } => ClientEvent::TypingInput { room_id, text },
            Command::Visibility(visible) => ClientEvent::VisibilityChanged { visible },
            Command::Credential(credential) => {
                // REST goes first so no fallback runs with the old credential
                self.rest.set_credential(credential.clone());
                ClientEvent::SetCredential(credential)
            },
            Command::MarkNotificationsRead => ClientEvent::MarkNotificationsRead,
            Command::Reset => ClientEvent::Reset,
            Command::Shutdown => return,
        };
        let actions = self.client.handle(event);
        self.execute(actions);
    }

    fn execute(&self, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::BindHandlers { handle } => {
                    tracing::debug!(handle = handle.id(), "binding channel handlers");
                    self.channel.bind(self.events_tx.clone());
                },
                ClientAction::Open { handle, open_id, endpoint, credential } => {
                    tracing::info!(%endpoint, open_id = open_id.get(), "opening channel");
                    self.channel.open(OpenRequest { handle, open_id, endpoint, credential });
                },
                ClientAction::Close { reason } => {
                    tracing::info!(%reason, "closing channel");
                    self.channel.close(&reason);
                },
                ClientAction::Emit(action) => {
                    if let Err(err) = self.channel.emit(&action) {
                        tracing::debug!(event = action.event_name(), %err, "emit dropped");
                    }
                },
                ClientAction::Alert(alert) => {
                    if self.alerts.try_send(alert).is_err() {
                        tracing::warn!("alert dropped, receiver full or gone");
                    }
                },
            }
        }
    }
}
