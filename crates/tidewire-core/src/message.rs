//! Canonical message record and the normalizer that produces it.
//!
//! Inbound payloads differ by origin (push, ack body, REST response, history
//! page): the sender may be called `fromSessionId` or `authorSessionId`, the
//! timestamp may be a number or an ISO string, media lists may be absent.
//! [`normalize`] folds all of them into one [`Message`] shape and never fails;
//! malformed fields degrade to safe defaults.
//!
//! # Identity
//!
//! A message keeps its server-assigned id when one is present. Otherwise
//! [`synthesize_id`] derives a stable id from the normalized
//! `(sender, timestamp, text)` tuple, so redelivery of the same logical event
//! always yields the same id.
//!
//! Two distinct messages with an identical tuple collapse into one id. This is
//! an accepted limitation: the server assigns ids to everything it persists,
//! and synthesized ids only cover payloads that arrive without one.

use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Sender aliases, in priority order.
pub const SENDER_FIELDS: [&str; 5] =
    ["fromSessionId", "senderSessionId", "authorSessionId", "sessionId", "from"];

/// Domain separation tag for synthesized ids. Bump the suffix if the encoding
/// below ever changes.
const ID_DOMAIN: &[u8] = b"tidewire/message-id/v1";

/// Prefix marking an id as synthesized rather than server-assigned.
pub const SYNTHETIC_ID_PREFIX: &str = "syn:";

/// Identifies a conversation: a room or a direct thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ConversationKey {
    /// Group room
    Room(String),
    /// Direct-message thread
    #[serde(rename = "dm")]
    Direct(String),
}

impl ConversationKey {
    /// Room conversation key.
    pub fn room(id: impl Into<String>) -> Self {
        Self::Room(id.into())
    }

    /// Direct thread conversation key.
    pub fn direct(id: impl Into<String>) -> Self {
        Self::Direct(id.into())
    }

    /// Room or thread identifier without the namespace.
    pub fn id(&self) -> &str {
        match self {
            Self::Room(id) | Self::Direct(id) => id,
        }
    }

    /// Returns true for room conversations.
    pub fn is_room(&self) -> bool {
        matches!(self, Self::Room(_))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(id) => write!(f, "room:{id}"),
            Self::Direct(id) => write!(f, "dm:{id}"),
        }
    }
}

/// Message identifier, server-assigned or synthesized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an id string as-is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this id was derived locally rather than assigned by
    /// the server.
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_ID_PREFIX)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// References to media attached to a message. Uploading is not our concern;
/// we only carry the references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRefs {
    /// Public URLs of attached media
    pub media_urls: Vec<String>,
    /// Server-side media ids
    pub media_ids: Vec<String>,
}

impl MediaRefs {
    /// Returns true if nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.media_urls.is_empty() && self.media_ids.is_empty()
    }
}

/// Canonical message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique within its conversation
    pub id: MessageId,
    /// Owning conversation
    pub conversation: ConversationKey,
    /// Message text, possibly empty
    pub text: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Author, if the payload named one
    pub sender_id: Option<String>,
    /// Attached media references
    pub media: MediaRefs,
}

/// Folds an arbitrary inbound payload into a [`Message`].
///
/// Resolution rules:
/// - timestamp: numeric `ts`, else RFC 3339 `createdAt`, else `now_ms`
/// - sender: first populated field of [`SENDER_FIELDS`]
/// - text: `text`, else `body`, else empty
/// - id: `id`, else `_id`, else [`synthesize_id`]
/// - media: `mediaUrls` / `mediaIds`, non-string entries dropped
pub fn normalize(conversation: ConversationKey, raw: &Value, now_ms: i64) -> Message {
    let timestamp = resolve_timestamp(raw, now_ms);
    let sender_id = SENDER_FIELDS.iter().find_map(|field| scalar_string(raw.get(field)));
    let text = ["text", "body"]
        .iter()
        .find_map(|field| raw.get(field).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let id = ["id", "_id"]
        .iter()
        .find_map(|field| scalar_string(raw.get(field)))
        .map_or_else(|| synthesize_id(sender_id.as_deref(), timestamp, &text), MessageId);

    let media = MediaRefs {
        media_urls: string_list(raw.get("mediaUrls")),
        media_ids: string_list(raw.get("mediaIds")),
    };

    Message { id, conversation, text, timestamp, sender_id, media }
}

/// Deterministic id for a payload without one.
///
/// SHA-256 over:
///
/// ```text
/// "tidewire/message-id/v1"
/// sender:    0x00                          (absent)
///          | 0x01 || u64 BE len || bytes   (present)
/// timestamp: i64 BE
/// text:      u64 BE len || bytes
/// ```
///
/// rendered as `syn:` followed by the first 16 digest bytes in lowercase hex.
/// Length prefixes keep `("ab", "c")` and `("a", "bc")` apart.
pub fn synthesize_id(sender_id: Option<&str>, timestamp: i64, text: &str) -> MessageId {
    let mut hasher = Sha256::new();
    hasher.update(ID_DOMAIN);
    match sender_id {
        None => hasher.update([0u8]),
        Some(sender) => {
            hasher.update([1u8]);
            hasher.update((sender.len() as u64).to_be_bytes());
            hasher.update(sender.as_bytes());
        },
    }
    hasher.update(timestamp.to_be_bytes());
    hasher.update((text.len() as u64).to_be_bytes());
    hasher.update(text.as_bytes());

    let digest = hasher.finalize();
    MessageId(format!("{SYNTHETIC_ID_PREFIX}{}", hex::encode(&digest[..16])))
}

fn resolve_timestamp(raw: &Value, now_ms: i64) -> i64 {
    if let Some(ts) = raw.get("ts").and_then(numeric) {
        return ts;
    }

    match raw.get("createdAt") {
        Some(Value::String(iso)) => DateTime::parse_from_rfc3339(iso)
            .map(|parsed| parsed.timestamp_millis())
            .unwrap_or(now_ms),
        Some(value) => numeric(value).unwrap_or(now_ms),
        None => now_ms,
    }
}

/// Integer milliseconds from a JSON number or numeric string.
fn numeric(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        },
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Non-empty string from a JSON string or number.
fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}
