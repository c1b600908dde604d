//! Client events and actions.

use serde_json::Value;
use tidewire_core::{Alert, ChannelHandle, ConversationKey, OpenId, OutboundAction, TransportEvent};

/// Events the caller feeds into the client.
///
/// The caller is responsible for:
/// - Forwarding transport lifecycle and inbound server events
/// - Driving time forward via ticks
/// - Forwarding UI intents (focus, typing, visibility, credential)
///
/// Generic over `I` (Instant type) so tests can drive a virtual clock.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<I = std::time::Instant> {
    /// Ensure the channel exists (idempotent).
    Connect,

    /// New handshake credential from the session collaborator.
    SetCredential(Option<String>),

    /// Tear down the channel (logout).
    Reset,

    /// Document visibility changed.
    VisibilityChanged {
        /// Foreground or background
        visible: bool,
    },

    /// Transport lifecycle of open `open_id`.
    Transport {
        /// Which open produced this event
        open_id: OpenId,
        /// What happened
        event: TransportEvent,
    },

    /// Named server event.
    Inbound {
        /// Event name, e.g. `msg:new`
        name: String,
        /// Event payload
        data: Value,
    },

    /// Time tick for timers.
    Tick {
        /// Current time from the environment
        now: I,
        /// What the socket reports right now
        transport_connected: bool,
    },

    /// The view moved to another conversation.
    Focus {
        /// Conversation on screen
        conversation: Option<ConversationKey>,
        /// Peer of a direct thread
        peer: Option<String>,
    },

    /// Composer text changed.
    TypingInput {
        /// Room being typed in
        room_id: String,
        /// Current composer text
        text: String,
    },

    /// A page of history arrived.
    HistoryLoaded {
        /// Conversation the page belongs to
        conversation: ConversationKey,
        /// Raw message payloads
        messages: Vec<Value>,
    },

    /// The user opened the notification list.
    MarkNotificationsRead,
}

/// Actions the client asks the caller to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Register inbound handlers on the channel.
    BindHandlers {
        /// Handle to bind on
        handle: ChannelHandle,
    },

    /// Open the channel.
    Open {
        /// Process-wide handle
        handle: ChannelHandle,
        /// Tag for transport events produced by this open
        open_id: OpenId,
        /// Target endpoint
        endpoint: String,
        /// Handshake credential
        credential: Option<String>,
    },

    /// Close the channel.
    Close {
        /// Close reason
        reason: String,
    },

    /// Emit without waiting for an ack.
    Emit(OutboundAction),

    /// Interrupt the user.
    Alert(Alert),
}
