//! I/O seams: the realtime channel and the REST fallback.
//!
//! The [`Client`](crate::Client) never performs I/O. The runtime executes its
//! actions against a [`Channel`] and a [`RestApi`], which production code backs
//! with a websocket and HTTP (feature `transport`) and tests back with
//! in-memory fakes.

use async_trait::async_trait;
use serde_json::Value;
use tidewire_core::{
    Ack, ChannelHandle, ConnectionError, ConversationKey, OpenId, OutboundAction, SendError,
    TransportEvent,
};
use tokio::sync::{mpsc, oneshot};

/// Everything the channel reports back to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Lifecycle of open `open_id`
    Transport {
        /// Which open produced this event
        open_id: OpenId,
        /// What happened
        event: TransportEvent,
    },
    /// Named server event
    Inbound {
        /// Event name, e.g. `msg:new`
        name: String,
        /// Event payload
        data: Value,
    },
}

/// Parameters of one physical open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Process-wide handle
    pub handle: ChannelHandle,
    /// Tag to put on transport events
    pub open_id: OpenId,
    /// Endpoint URL
    pub endpoint: String,
    /// Handshake credential
    pub credential: Option<String>,
}

/// Bidirectional event channel.
///
/// Methods take `&self` so the runtime and in-flight sends can share one
/// instance. `open` must not block: implementations spawn the connection and
/// report the outcome as [`ChannelEvent::Transport`] through the bound sink.
pub trait Channel: Send + Sync + 'static {
    /// Register the inbound sink. Called once per handle.
    fn bind(&self, sink: mpsc::Sender<ChannelEvent>);

    /// Drop any current connection and start a new one.
    fn open(&self, request: OpenRequest);

    /// Drop the current connection.
    fn close(&self, reason: &str);

    /// Whether the underlying connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Emit without waiting for an acknowledgement.
    fn emit(&self, action: &OutboundAction) -> Result<(), ConnectionError>;

    /// Emit with an acknowledgement callback.
    ///
    /// The receiver resolves with the server's ack. Dropping it abandons the
    /// wait; a late ack is then discarded by the channel.
    fn emit_with_ack(
        &self,
        action: &OutboundAction,
    ) -> Result<oneshot::Receiver<Ack>, ConnectionError>;
}

/// Request/response surface used for the send fallback and history.
#[async_trait]
pub trait RestApi: Send + Sync + 'static {
    /// Append a message to a conversation; returns the persisted message body.
    async fn append_message(
        &self,
        conversation: &ConversationKey,
        body: &Value,
    ) -> Result<Value, SendError>;

    /// Replace the credential sent with every later request.
    fn set_credential(&self, credential: Option<String>);

    /// Most recent messages of a conversation.
    async fn list_messages(
        &self,
        conversation: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<Value>, SendError>;
}
