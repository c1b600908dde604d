//! The single immutable view of client state.
//!
//! A [`Snapshot`] is never mutated in place. The store builds a new one for
//! every [`SnapshotPatch`] and hands subscribers an `Arc` of it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    message::{ConversationKey, Message},
    send::PendingSend,
};

/// Default notification ring capacity.
pub const DEFAULT_NOTIFICATION_CAP: usize = 200;

/// Notification category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationKind {
    /// Direct message
    Dm,
    /// Room message
    Room,
    /// Call lifecycle
    Call,
    /// Invite lifecycle
    Invite,
    /// Client-side condition (connection loss, transport error)
    System,
}

impl NotificationKind {
    /// Upper-case wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dm => "DM",
            Self::Room => "ROOM",
            Self::Call => "CALL",
            Self::Invite => "INVITE",
            Self::System => "SYSTEM",
        }
    }
}

/// Notification as pushed by a component, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDraft {
    /// Explicit id; synthesized when absent
    pub id: Option<String>,
    /// Category
    pub kind: NotificationKind,
    /// Headline
    pub title: String,
    /// Optional detail line
    pub body: Option<String>,
    /// Conversation or entity the notification points at
    pub key: Option<String>,
    /// Wall clock ms
    pub ts: i64,
}

impl NotificationDraft {
    /// Draft without body or key.
    pub fn new(kind: NotificationKind, title: impl Into<String>, ts: i64) -> Self {
        Self { id: None, kind, title: title.into(), body: None, key: None, ts }
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach a key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Id used for dedup: explicit, or `kind:key:ts:title:body`.
    pub fn resolved_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            format!(
                "{}:{}:{}:{}:{}",
                self.kind.as_str(),
                self.key.as_deref().unwrap_or_default(),
                self.ts,
                self.title,
                self.body.as_deref().unwrap_or_default(),
            )
        })
    }
}

/// Stored notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique within the ring
    pub id: String,
    /// Category
    pub kind: NotificationKind,
    /// Headline
    pub title: String,
    /// Optional detail line
    pub body: Option<String>,
    /// Conversation or entity the notification points at
    pub key: Option<String>,
    /// Wall clock ms
    pub ts: i64,
    /// Seen by the user
    pub read: bool,
}

impl From<NotificationDraft> for Notification {
    fn from(draft: NotificationDraft) -> Self {
        let id = draft.resolved_id();
        Self {
            id,
            kind: draft.kind,
            title: draft.title,
            body: draft.body,
            key: draft.key,
            ts: draft.ts,
            read: false,
        }
    }
}

/// Incoming or active call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    /// Server call id
    pub call_id: String,
    /// Other party
    pub peer_id: String,
    /// Room the call belongs to, if any
    pub room_id: Option<String>,
}

/// Realtime channel status as observed by the connection manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// No handle yet, or reset
    #[default]
    Idle,
    /// Open in flight
    Connecting,
    /// Channel open
    Connected,
    /// Waiting to retry after a failure
    Reconnecting,
}

/// Room summary for room lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    /// Room id
    pub id: String,
    /// Display name
    pub name: String,
}

/// Everything a view may render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Our own participant id, once known
    pub self_id: Option<String>,
    /// Conversation currently on screen
    pub focus: Option<ConversationKey>,
    /// Peer of the focused direct thread
    pub active_peer: Option<String>,
    /// Messages per conversation, ascending by timestamp
    pub conversations: HashMap<ConversationKey, Vec<Message>>,
    /// Participant ids per room
    pub presence: HashMap<String, Vec<String>>,
    /// Typing flags per room, keyed by participant id
    pub typing: HashMap<String, HashMap<String, bool>>,
    /// Newest first
    pub notifications: Vec<Notification>,
    /// Ringing call awaiting an answer
    pub incoming_call: Option<CallInfo>,
    /// Accepted call in progress
    pub active_call: Option<CallInfo>,
    /// Realtime channel status
    pub channel_status: ChannelStatus,
    /// Known rooms
    pub rooms: Vec<RoomSummary>,
    /// Locally authored messages not yet confirmed, oldest first
    pub outbox: Vec<PendingSend>,
}

impl Snapshot {
    /// Messages of a conversation, empty if none.
    pub fn messages(&self, key: &ConversationKey) -> &[Message] {
        self.conversations.get(key).map_or(&[], Vec::as_slice)
    }

    /// Number of unread notifications.
    pub fn unread_notifications(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    /// Merge a patch into a copy of this snapshot.
    ///
    /// Shallow: each present field replaces the whole field.
    #[must_use]
    pub fn apply(&self, patch: SnapshotPatch) -> Self {
        let mut next = self.clone();
        let SnapshotPatch {
            self_id,
            focus,
            active_peer,
            conversations,
            presence,
            typing,
            notifications,
            incoming_call,
            active_call,
            channel_status,
            rooms,
            outbox,
        } = patch;

        if let Some(v) = self_id {
            next.self_id = v;
        }
        if let Some(v) = focus {
            next.focus = v;
        }
        if let Some(v) = active_peer {
            next.active_peer = v;
        }
        if let Some(v) = conversations {
            next.conversations = v;
        }
        if let Some(v) = presence {
            next.presence = v;
        }
        if let Some(v) = typing {
            next.typing = v;
        }
        if let Some(v) = notifications {
            next.notifications = v;
        }
        if let Some(v) = incoming_call {
            next.incoming_call = v;
        }
        if let Some(v) = active_call {
            next.active_call = v;
        }
        if let Some(v) = channel_status {
            next.channel_status = v;
        }
        if let Some(v) = rooms {
            next.rooms = v;
        }
        if let Some(v) = outbox {
            next.outbox = v;
        }
        next
    }
}

/// Partial snapshot. `None` leaves a field untouched; for optional fields
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(clippy::option_option)]
pub struct SnapshotPatch {
    /// Replace `self_id`
    pub self_id: Option<Option<String>>,
    /// Replace `focus`
    pub focus: Option<Option<ConversationKey>>,
    /// Replace `active_peer`
    pub active_peer: Option<Option<String>>,
    /// Replace `conversations`
    pub conversations: Option<HashMap<ConversationKey, Vec<Message>>>,
    /// Replace `presence`
    pub presence: Option<HashMap<String, Vec<String>>>,
    /// Replace `typing`
    pub typing: Option<HashMap<String, HashMap<String, bool>>>,
    /// Replace `notifications`
    pub notifications: Option<Vec<Notification>>,
    /// Replace `incoming_call`
    pub incoming_call: Option<Option<CallInfo>>,
    /// Replace `active_call`
    pub active_call: Option<Option<CallInfo>>,
    /// Replace `channel_status`
    pub channel_status: Option<ChannelStatus>,
    /// Replace `rooms`
    pub rooms: Option<Vec<RoomSummary>>,
    /// Replace `outbox`
    pub outbox: Option<Vec<PendingSend>>,
}

impl SnapshotPatch {
    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
