//! Alert policy: should an admitted event interrupt the user?
//!
//! Evaluated after the event is applied to the store, against that same
//! snapshot, so the conversation on screen and the decision always agree.

use crate::{
    message::{ConversationKey, Message},
    snapshot::{CallInfo, NotificationKind, Snapshot},
};

/// Audible and visual interruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Category
    pub kind: NotificationKind,
    /// Headline
    pub title: String,
    /// Detail line
    pub body: Option<String>,
    /// Conversation the alert points at; `None` for calls outside a room
    pub conversation: Option<ConversationKey>,
    /// Play a tone
    pub tone: bool,
}

/// Outcome of [`AlertPolicy::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertDecision {
    /// Conversation is on screen; stay quiet
    Suppress,
    /// Interrupt
    Raise(Alert),
}

/// Stateless decision rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertPolicy;

impl AlertPolicy {
    /// Suppress if `message` belongs to the focused conversation.
    pub fn evaluate(&self, snapshot: &Snapshot, message: &Message) -> AlertDecision {
        if snapshot.focus.as_ref() == Some(&message.conversation) {
            return AlertDecision::Suppress;
        }

        let kind = match message.conversation {
            ConversationKey::Room(_) => NotificationKind::Room,
            ConversationKey::Direct(_) => NotificationKind::Dm,
        };
        let title = match (&message.conversation, message.sender_id.as_deref()) {
            (ConversationKey::Room(room), _) => format!("New message in {room}"),
            (ConversationKey::Direct(_), Some(sender)) => format!("New message from {sender}"),
            (ConversationKey::Direct(_), None) => "New direct message".to_string(),
        };

        AlertDecision::Raise(Alert {
            kind,
            title,
            body: (!message.text.is_empty()).then(|| message.text.clone()),
            conversation: Some(message.conversation.clone()),
            tone: true,
        })
    }

    /// Ringing calls always alert; there is nothing to be focused on.
    pub fn evaluate_call(&self, call: &CallInfo) -> AlertDecision {
        AlertDecision::Raise(Alert {
            kind: NotificationKind::Call,
            title: "Incoming call".to_string(),
            body: Some(format!("from {}", call.peer_id)),
            conversation: call.room_id.clone().map(ConversationKey::Room),
            tone: true,
        })
    }
}
