//! Wire vocabulary of the realtime channel.
//!
//! Inbound events arrive as `(name, data)` pairs. [`InboundEvent::parse`]
//! accepts both the colon-separated names the server emits (`msg:new`) and
//! their dotted aliases (`room.message.new`), and is lenient about everything
//! except the routing key. Outbound actions carry their event name and a JSON
//! payload; the server answers each with an [`Ack`].

use serde_json::{Value, json};

use crate::{
    error::PayloadError,
    message::{ConversationKey, MediaRefs},
};

/// Invite lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitePhase {
    /// Invite issued to us
    New,
    /// Our invite was accepted
    Accepted,
    /// Invite withdrawn
    Revoked,
}

impl InvitePhase {
    /// Human-readable verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Accepted => "accepted",
            Self::Revoked => "revoked",
        }
    }
}

/// Event pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Participant set of a room, replaced wholesale
    Presence {
        /// Room id
        room_id: String,
        /// Everyone currently present
        participants: Vec<String>,
    },
    /// New message in a room
    RoomMessage {
        /// Room id
        room_id: String,
        /// Raw message payload, normalized later
        message: Value,
    },
    /// New message in a direct thread
    DirectMessage {
        /// Thread id
        thread_id: String,
        /// Raw message payload, normalized later
        message: Value,
    },
    /// Typing flag of one participant
    Typing {
        /// Room id
        room_id: String,
        /// Who is typing
        participant_id: String,
        /// Started or stopped
        is_typing: bool,
    },
    /// Someone is calling us
    CallRing {
        /// Server call id
        call_id: String,
        /// Caller
        from: String,
        /// Room the call belongs to
        room_id: Option<String>,
    },
    /// Our call was accepted
    CallAccepted {
        /// Server call id
        call_id: String,
        /// Who accepted
        by: String,
    },
    /// Call finished
    CallEnded {
        /// Server call id
        call_id: String,
        /// Why, if given
        reason: Option<String>,
    },
    /// Callee is already on a call
    CallBusy {
        /// Callee
        target: String,
    },
    /// Invite lifecycle change
    Invite {
        /// Which change
        phase: InvitePhase,
        /// Invite token
        token: String,
        /// Invite kind (room, contact), if given
        kind: Option<String>,
    },
}

impl InboundEvent {
    /// Parse a named event.
    ///
    /// # Errors
    ///
    /// - `PayloadError::UnknownEvent` for names we do not consume
    /// - `PayloadError::MissingField` if the routing key is absent
    pub fn parse(name: &str, data: &Value) -> Result<Self, PayloadError> {
        let field = |field: &'static str| required(name, data, &[field]);

        match name {
            "presence:update" | "presence.update" => Ok(Self::Presence {
                room_id: field("roomId")?,
                participants: string_list(data, &["sessionIds", "participantIds"]),
            }),
            "msg:new" | "room.message.new" => Ok(Self::RoomMessage {
                room_id: field("roomId")?,
                message: message_body(name, data)?,
            }),
            "dm:new" | "direct.message.new" => Ok(Self::DirectMessage {
                thread_id: required(name, data, &["threadId", "threadKey"])?,
                message: message_body(name, data)?,
            }),
            "typing:update" | "typing.update" => Ok(Self::Typing {
                room_id: field("roomId")?,
                participant_id: required(name, data, &["sessionId", "participantId"])?,
                is_typing: data.get("isTyping").and_then(Value::as_bool).unwrap_or(false),
            }),
            "call:ring" => Ok(Self::CallRing {
                call_id: field("callId")?,
                from: optional(data, &["fromSessionId", "from"]).unwrap_or_default(),
                room_id: optional(data, &["roomId"]),
            }),
            "call:accepted" => Ok(Self::CallAccepted {
                call_id: field("callId")?,
                by: optional(data, &["bySessionId", "by"]).unwrap_or_default(),
            }),
            "call:ended" => Ok(Self::CallEnded {
                call_id: field("callId")?,
                reason: optional(data, &["reason"]),
            }),
            "call:busy" => Ok(Self::CallBusy {
                target: optional(data, &["targetSessionId"]).unwrap_or_default(),
            }),
            "invite:new" | "invite:accepted" | "invite:revoked" => {
                let phase = match name {
                    "invite:new" => InvitePhase::New,
                    "invite:accepted" => InvitePhase::Accepted,
                    _ => InvitePhase::Revoked,
                };
                Ok(Self::Invite { phase, token: field("token")?, kind: optional(data, &["kind"]) })
            },
            other => Err(PayloadError::UnknownEvent(other.to_string())),
        }
    }

    /// Conversation a message event belongs to.
    pub fn conversation(&self) -> Option<ConversationKey> {
        match self {
            Self::RoomMessage { room_id, .. } => Some(ConversationKey::room(room_id.clone())),
            Self::DirectMessage { thread_id, .. } => {
                Some(ConversationKey::direct(thread_id.clone()))
            },
            _ => None,
        }
    }
}

/// Action emitted to the server with an acknowledgement callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Join a room
    JoinRoom {
        /// Room id
        room_id: String,
    },
    /// Leave a room
    LeaveRoom {
        /// Room id
        room_id: String,
    },
    /// Create a room
    CreateRoom {
        /// Display name
        name: String,
    },
    /// Post to a room
    SendRoomMessage {
        /// Room id
        room_id: String,
        /// Message text
        text: String,
        /// Attached media references
        media: MediaRefs,
    },
    /// Open (or fetch) a direct thread with a peer
    OpenDirect {
        /// Peer id
        target_id: String,
    },
    /// Post to a direct thread
    SendDirectMessage {
        /// Thread id
        thread_id: String,
        /// Message text
        text: String,
        /// Attached media references
        media: MediaRefs,
    },
    /// We started typing
    TypingStart {
        /// Room id
        room_id: String,
    },
    /// We stopped typing
    TypingStop {
        /// Room id
        room_id: String,
    },
    /// Ring a peer
    CallStart {
        /// Peer id
        target_id: String,
        /// Room the call belongs to
        room_id: Option<String>,
    },
    /// Answer a ringing call
    CallAccept {
        /// Server call id
        call_id: String,
    },
    /// Hang up or decline
    CallEnd {
        /// Server call id
        call_id: String,
        /// Why
        reason: String,
    },
}

impl OutboundAction {
    /// Message send to `conversation`.
    pub fn send_message(
        conversation: &ConversationKey,
        text: impl Into<String>,
        media: MediaRefs,
    ) -> Self {
        match conversation {
            ConversationKey::Room(room_id) => {
                Self::SendRoomMessage { room_id: room_id.clone(), text: text.into(), media }
            },
            ConversationKey::Direct(thread_id) => {
                Self::SendDirectMessage { thread_id: thread_id.clone(), text: text.into(), media }
            },
        }
    }

    /// Wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "room:join",
            Self::LeaveRoom { .. } => "room:leave",
            Self::CreateRoom { .. } => "room:create",
            Self::SendRoomMessage { .. } => "msg:send",
            Self::OpenDirect { .. } => "dm:open",
            Self::SendDirectMessage { .. } => "dm:send",
            Self::TypingStart { .. } => "typing:start",
            Self::TypingStop { .. } => "typing:stop",
            Self::CallStart { .. } => "call:start",
            Self::CallAccept { .. } => "call:accept",
            Self::CallEnd { .. } => "call:end",
        }
    }

    /// Wire payload.
    pub fn payload(&self) -> Value {
        match self {
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::TypingStart { room_id }
            | Self::TypingStop { room_id } => json!({ "roomId": room_id }),
            Self::CreateRoom { name } => json!({ "name": name }),
            Self::SendRoomMessage { room_id, text, media } => json!({
                "roomId": room_id,
                "text": text,
                "mediaUrls": media.media_urls,
                "mediaIds": media.media_ids,
            }),
            Self::OpenDirect { target_id } => json!({ "targetSessionId": target_id }),
            Self::SendDirectMessage { thread_id, text, media } => json!({
                "threadId": thread_id,
                "text": text,
                "mediaUrls": media.media_urls,
                "mediaIds": media.media_ids,
            }),
            Self::CallStart { target_id, room_id } => {
                json!({ "targetSessionId": target_id, "roomId": room_id })
            },
            Self::CallAccept { call_id } => json!({ "callId": call_id }),
            Self::CallEnd { call_id, reason } => json!({ "callId": call_id, "reason": reason }),
        }
    }

    /// Conversation a message send targets.
    pub fn conversation(&self) -> Option<ConversationKey> {
        match self {
            Self::SendRoomMessage { room_id, .. } => Some(ConversationKey::room(room_id.clone())),
            Self::SendDirectMessage { thread_id, .. } => {
                Some(ConversationKey::direct(thread_id.clone()))
            },
            _ => None,
        }
    }

    /// Fire-and-forget actions are emitted without waiting for an ack.
    pub fn expects_ack(&self) -> bool {
        !matches!(self, Self::TypingStart { .. } | Self::TypingStop { .. })
    }
}

/// Server acknowledgement of an outbound action.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// Success flag; absent counts as failure
    pub ok: bool,
    /// Server error string
    pub error: Option<String>,
    /// Persisted message, if the server embedded it
    pub message: Option<Value>,
    /// Whole ack payload for action-specific fields (e.g. `threadId`)
    pub data: Value,
}

impl Ack {
    /// Read an ack payload. Never fails; non-objects read as `ok: false`.
    pub fn from_value(data: Value) -> Self {
        let ok = data.get("ok").and_then(Value::as_bool).unwrap_or(false);
        let error = data.get("error").and_then(Value::as_str).map(str::to_string);
        let message = data.get("message").filter(|m| m.is_object()).cloned();
        Self { ok, error, message, data }
    }

    /// Positive ack carrying a persisted message.
    pub fn ok_with_message(message: Value) -> Self {
        Self::from_value(json!({ "ok": true, "message": message }))
    }

    /// Negative ack.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self::from_value(json!({ "ok": false, "error": error.into() }))
    }
}

fn required(event: &str, data: &Value, fields: &[&'static str]) -> Result<String, PayloadError> {
    optional(data, fields).ok_or_else(|| PayloadError::MissingField {
        event: event.to_string(),
        field: fields.first().copied().unwrap_or("?"),
    })
}

fn optional(data: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match data.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn string_list(data: &Value, fields: &[&str]) -> Vec<String> {
    fields
        .iter()
        .find_map(|field| data.get(field).and_then(Value::as_array))
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn message_body(event: &str, data: &Value) -> Result<Value, PayloadError> {
    data.get("message")
        .filter(|m| m.is_object())
        .cloned()
        .ok_or_else(|| PayloadError::MissingField { event: event.to_string(), field: "message" })
}
