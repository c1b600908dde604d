//! Sans-IO client: the composition root.
//!
//! Owns the [`ConnectionManager`], the [`Store`], the [`Reconciler`], the
//! [`AlertPolicy`], and the typing debounce. Events go in through
//! [`Client::handle`], actions come out; store updates happen inline through
//! the store's patch API.

use tidewire_core::{
    AlertDecision, AlertPolicy, CallInfo, ConnectionAction, ConnectionManager, ConversationKey,
    DeliveryPath, Environment, InboundEvent, Message, NotificationDraft, NotificationKind,
    Reconciler, Store, dedup::DedupKey, protocol::InvitePhase,
};

use crate::{
    config::ClientConfig,
    event::{ClientAction, ClientEvent},
    typing::TypingDebounce,
};

/// Realtime synchronization client.
#[derive(Debug)]
pub struct Client<E: Environment> {
    env: E,
    connection: ConnectionManager<E>,
    store: Store,
    reconciler: Reconciler,
    alerts: AlertPolicy,
    typing: TypingDebounce<E::Instant>,
}

impl<E: Environment> Client<E> {
    /// Create a client with an empty store and no channel.
    pub fn new(env: E, config: &ClientConfig, credential: Option<String>) -> Self {
        let store = Store::new(config.notification_cap);
        let reconciler = Reconciler::new(store.clone(), config.dedup());
        Self {
            connection: ConnectionManager::new(env.clone(), config.connection(), credential),
            env,
            store,
            reconciler,
            alerts: AlertPolicy,
            typing: TypingDebounce::new(config.typing_idle()),
        }
    }

    /// Store handle for subscribers.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Shared identity path, for the send coordinator.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Connection manager, read-only.
    pub fn connection(&self) -> &ConnectionManager<E> {
        &self.connection
    }

    /// Process an event and return actions for the caller.
    pub fn handle(&mut self, event: ClientEvent<E::Instant>) -> Vec<ClientAction> {
        match event {
            ClientEvent::Connect => {
                let (_, actions) = self.connection.connect(self.env.now());
                self.apply_connection(actions)
            },
            ClientEvent::SetCredential(credential) => {
                let actions = self.connection.set_credential(credential, self.env.now());
                self.apply_connection(actions)
            },
            ClientEvent::Reset => {
                let actions = self.connection.reset();
                self.apply_connection(actions)
            },
            ClientEvent::VisibilityChanged { visible } => {
                let actions = self.connection.set_visibility(visible, self.env.now());
                self.apply_connection(actions)
            },
            ClientEvent::Transport { open_id, event } => {
                let actions = self.connection.handle_transport(open_id, event, self.env.now());
                self.apply_connection(actions)
            },
            ClientEvent::Inbound { name, data } => self.handle_inbound(&name, &data),
            ClientEvent::Tick { now, transport_connected } => {
                self.handle_tick(now, transport_connected)
            },
            ClientEvent::Focus { conversation, peer } => {
                self.store.set_focus(conversation, peer);
                Vec::new()
            },
            ClientEvent::TypingInput { room_id, text } => {
                self.typing
                    .input(&room_id, &text, self.env.now())
                    .into_iter()
                    .map(ClientAction::Emit)
                    .collect()
            },
            ClientEvent::HistoryLoaded { conversation, messages } => {
                let now_ms = self.env.wall_clock_ms();
                let inserted = self.reconciler.deliver_history(&conversation, &messages, now_ms);
                tracing::debug!(
                    %conversation,
                    received = messages.len(),
                    inserted,
                    "history merged"
                );
                Vec::new()
            },
            ClientEvent::MarkNotificationsRead => {
                self.store.mark_all_notifications_read();
                Vec::new()
            },
        }
    }

    /// Stop typing in `room_id` (e.g. the message was just sent).
    pub fn stop_typing(&mut self, room_id: &str) -> Vec<ClientAction> {
        self.typing.stop(room_id).into_iter().map(ClientAction::Emit).collect()
    }

    fn handle_tick(&mut self, now: E::Instant, transport_connected: bool) -> Vec<ClientAction> {
        let mut actions: Vec<_> =
            self.typing.tick(now).into_iter().map(ClientAction::Emit).collect();
        let connection_actions = self.connection.tick(now, transport_connected);
        actions.extend(self.apply_connection(connection_actions));
        actions
    }

    /// Route connection actions: store updates happen here, I/O goes out.
    fn apply_connection(&mut self, actions: Vec<ConnectionAction>) -> Vec<ClientAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                ConnectionAction::BindHandlers { handle } => {
                    out.push(ClientAction::BindHandlers { handle });
                },
                ConnectionAction::Open { handle, open_id, endpoint, credential } => {
                    out.push(ClientAction::Open { handle, open_id, endpoint, credential });
                },
                ConnectionAction::Close { reason, .. } => out.push(ClientAction::Close { reason }),
                ConnectionAction::Notify(draft) => {
                    self.store.push_notification(draft);
                },
                ConnectionAction::Status(status) => self.store.set_channel_status(status),
            }
        }
        out
    }

    fn handle_inbound(&mut self, name: &str, data: &serde_json::Value) -> Vec<ClientAction> {
        let event = match InboundEvent::parse(name, data) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(event = name, %err, "inbound event dropped");
                return Vec::new();
            },
        };
        let now_ms = self.env.wall_clock_ms();

        match event {
            InboundEvent::RoomMessage { room_id, message } => {
                self.handle_message(ConversationKey::room(room_id), &message, now_ms)
            },
            InboundEvent::DirectMessage { thread_id, message } => {
                self.handle_message(ConversationKey::direct(thread_id), &message, now_ms)
            },
            InboundEvent::Presence { room_id, participants } => {
                self.store.set_presence(&room_id, participants);
                Vec::new()
            },
            InboundEvent::Typing { room_id, participant_id, is_typing } => {
                self.store.set_typing(&room_id, &participant_id, is_typing);
                Vec::new()
            },
            InboundEvent::CallRing { call_id, from, room_id } => {
                self.handle_ring(CallInfo { call_id, peer_id: from, room_id }, now_ms)
            },
            InboundEvent::CallAccepted { call_id, by } => {
                let snapshot = self.store.snapshot();
                let ringing = snapshot.incoming_call.clone().filter(|c| c.call_id == call_id);
                if ringing.is_some() {
                    self.store.set_incoming_call(None);
                }
                let call = ringing.unwrap_or(CallInfo { call_id, peer_id: by, room_id: None });
                self.store.set_active_call(Some(call));
                Vec::new()
            },
            InboundEvent::CallEnded { call_id, reason } => {
                let snapshot = self.store.snapshot();
                if snapshot.incoming_call.as_ref().is_some_and(|c| c.call_id == call_id) {
                    self.store.set_incoming_call(None);
                }
                if snapshot.active_call.as_ref().is_some_and(|c| c.call_id == call_id) {
                    self.store.set_active_call(None);
                }
                let mut draft = NotificationDraft::new(NotificationKind::Call, "Call ended", now_ms)
                    .with_key(format!("call:{call_id}"));
                if let Some(reason) = reason {
                    draft = draft.with_body(reason);
                }
                self.store.push_notification(draft);
                Vec::new()
            },
            InboundEvent::CallBusy { target } => {
                let draft = NotificationDraft::new(NotificationKind::Call, "User is busy", now_ms)
                    .with_body(target);
                self.store.push_notification(draft);
                Vec::new()
            },
            InboundEvent::Invite { phase, token, kind } => {
                let title = match phase {
                    InvitePhase::New => "New invite",
                    InvitePhase::Accepted => "Invite accepted",
                    InvitePhase::Revoked => "Invite revoked",
                };
                let mut draft = NotificationDraft::new(NotificationKind::Invite, title, now_ms)
                    .with_key(format!("invite:{token}"));
                draft.id = Some(format!("INVITE:{}:{token}", phase.as_str()));
                if let Some(kind) = kind {
                    draft = draft.with_body(kind);
                }
                self.store.push_notification(draft);
                Vec::new()
            },
        }
    }

    /// Admit, store, notify, then decide on an alert against the updated
    /// snapshot.
    fn handle_message(
        &mut self,
        conversation: ConversationKey,
        raw: &serde_json::Value,
        now_ms: i64,
    ) -> Vec<ClientAction> {
        let delivered = self.reconciler.deliver(conversation, raw, DeliveryPath::Push, now_ms);
        let Some(message) = delivered else {
            return Vec::new();
        };

        self.store.push_notification(message_notification(&message));

        let snapshot = self.store.snapshot();
        match self.alerts.evaluate(&snapshot, &message) {
            AlertDecision::Suppress => Vec::new(),
            AlertDecision::Raise(alert) => vec![ClientAction::Alert(alert)],
        }
    }

    fn handle_ring(&mut self, call: CallInfo, now_ms: i64) -> Vec<ClientAction> {
        if !self.reconciler.admit_event(DedupKey::event("call", call.call_id.clone()), now_ms) {
            return Vec::new();
        }

        self.store.set_incoming_call(Some(call.clone()));
        let mut draft = NotificationDraft::new(NotificationKind::Call, "Incoming call", now_ms)
            .with_key(format!("call:{}", call.call_id))
            .with_body(format!("from {}", call.peer_id));
        draft.id = Some(format!("CALL:ring:{}", call.call_id));
        self.store.push_notification(draft);

        match self.alerts.evaluate_call(&call) {
            AlertDecision::Suppress => Vec::new(),
            AlertDecision::Raise(alert) => vec![ClientAction::Alert(alert)],
        }
    }
}

fn message_notification(message: &Message) -> NotificationDraft {
    let (kind, title) = match &message.conversation {
        ConversationKey::Room(room) => (NotificationKind::Room, format!("New message in {room}")),
        ConversationKey::Direct(_) => (NotificationKind::Dm, "New direct message".to_string()),
    };
    let mut draft = NotificationDraft::new(kind, title, message.timestamp)
        .with_key(message.conversation.id());
    draft.id = Some(format!("{}:{}:{}", kind.as_str(), message.conversation, message.id));
    if !message.text.is_empty() {
        draft = draft.with_body(message.text.clone());
    }
    draft
}
