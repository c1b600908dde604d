//! Websocket [`Channel`] for production use.
//!
//! Frames are JSON text messages. Outbound:
//!
//! ```text
//! {"event": "msg:send", "data": {...}, "ackId": 7}
//! ```
//!
//! The server answers ack-bearing frames with `{"ackId": 7, "data": {...}}` and
//! pushes events as `{"event": "msg:new", "data": {...}}`. The handshake
//! credential travels in the `x-session-key` header.
//!
//! Each open spawns one connection task; opening again or closing aborts it.
//! Pending acks of an aborted connection are dropped, which the send
//! coordinator sees as a dropped ack and falls back to REST.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tidewire_core::{Ack, ConnectionError, OpenId, OutboundAction, TransportEvent};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::AbortHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};

use crate::channel::{Channel, ChannelEvent, OpenRequest};

/// Handshake header carrying the session credential.
pub const SESSION_HEADER: &str = "x-session-key";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Shared {
    sink: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<AbortHandle>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    next_ack: AtomicU64,
    connected: AtomicBool,
}

/// Websocket channel (tokio-tungstenite).
#[derive(Clone, Default)]
pub struct WsChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel").field("connected", &self.is_connected()).finish_non_exhaustive()
    }
}

impl WsChannel {
    /// Channel with no connection.
    pub fn new() -> Self {
        Self::default()
    }

    fn teardown(&self) {
        if let Some(task) = lock(&self.shared.task).take() {
            task.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        lock(&self.shared.outgoing).take();
        lock(&self.shared.pending).clear();
    }

    fn push(&self, action: &OutboundAction, ack_id: Option<u64>) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let mut envelope = json!({ "event": action.event_name(), "data": action.payload() });
        if let Some(id) = ack_id {
            envelope["ackId"] = json!(id);
        }

        let outgoing = lock(&self.shared.outgoing);
        let sender = outgoing.as_ref().ok_or(ConnectionError::NotConnected)?;
        sender.send(envelope.to_string()).map_err(|_| ConnectionError::NotConnected)
    }
}

impl Channel for WsChannel {
    fn bind(&self, sink: mpsc::Sender<ChannelEvent>) {
        *lock(&self.shared.sink) = Some(sink);
    }

    fn open(&self, request: OpenRequest) {
        self.teardown();

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outgoing) = Some(tx);
        let task = tokio::spawn(run_connection(Arc::clone(&self.shared), request, rx));
        *lock(&self.shared.task) = Some(task.abort_handle());
    }

    fn close(&self, reason: &str) {
        tracing::debug!(%reason, "websocket closed locally");
        self.teardown();
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, action: &OutboundAction) -> Result<(), ConnectionError> {
        self.push(action, None)
    }

    fn emit_with_ack(
        &self,
        action: &OutboundAction,
    ) -> Result<oneshot::Receiver<Ack>, ConnectionError> {
        let id = self.shared.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.shared.pending);
            // Receivers of timed-out sends are gone
            pending.retain(|_, waiting| !waiting.is_closed());
            pending.insert(id, tx);
        }

        if let Err(err) = self.push(action, Some(id)) {
            lock(&self.shared.pending).remove(&id);
            return Err(err);
        }
        Ok(rx)
    }
}

impl Shared {
    async fn report(&self, event: ChannelEvent) {
        let sink = lock(&self.sink).clone();
        match sink {
            Some(sink) => {
                if sink.send(event).await.is_err() {
                    tracing::debug!("channel event dropped, runtime gone");
                }
            },
            None => tracing::debug!("channel event dropped, no handlers bound"),
        }
    }

    async fn dispatch(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%err, "unparsable frame dropped");
                return;
            },
        };
        let data = frame.get("data").cloned().unwrap_or(Value::Null);

        if let Some(name) = frame.get("event").and_then(Value::as_str) {
            self.report(ChannelEvent::Inbound { name: name.to_string(), data }).await;
        } else if let Some(id) = frame.get("ackId").and_then(Value::as_u64) {
            let waiting = lock(&self.pending).remove(&id);
            if let Some(waiting) = waiting {
                // Receiver dropped after a timeout; the ack is discarded
                let _ = waiting.send(Ack::from_value(data));
            }
        } else {
            tracing::debug!("frame without event or ackId dropped");
        }
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    request: OpenRequest,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    let open_id = request.open_id;
    let socket = match connect(&request).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::warn!(%err, open_id = open_id.get(), "websocket connect failed");
            shared.report(transport(open_id, TransportEvent::Error(err))).await;
            return;
        },
    };

    shared.connected.store(true, Ordering::SeqCst);
    shared.report(transport(open_id, TransportEvent::Opened)).await;

    let (mut write, mut read) = socket.split();
    let reason = loop {
        tokio::select! {
            Some(text) = outgoing.recv() => {
                if let Err(err) = write.send(Message::Text(text)).await {
                    break err.to_string();
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text).await,
                Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                Some(Ok(_)) => {},
                Some(Err(err)) => break err.to_string(),
            },
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    lock(&shared.pending).clear();
    shared.report(transport(open_id, TransportEvent::Closed { reason })).await;
}

async fn connect(request: &OpenRequest) -> Result<Socket, ConnectionError> {
    let url = websocket_url(&request.endpoint)?;
    let mut handshake = url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
    if let Some(credential) = &request.credential {
        let value = HeaderValue::from_str(credential)
            .map_err(|e| ConnectionError::InvalidCredential(e.to_string()))?;
        handshake.headers_mut().insert(SESSION_HEADER, value);
    }

    let (socket, _) =
        connect_async(handshake).await.map_err(|e| ConnectionError::Transport(e.to_string()))?;
    Ok(socket)
}

/// Map an `http(s)://` endpoint onto `ws(s)://`; `ws(s)://` passes through.
///
/// # Errors
///
/// - `ConnectionError::InvalidEndpoint` for any other scheme
pub fn websocket_url(endpoint: &str) -> Result<String, ConnectionError> {
    let endpoint = endpoint.trim();
    if let Some(rest) = endpoint.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        Ok(endpoint.to_string())
    } else {
        Err(ConnectionError::InvalidEndpoint(endpoint.to_string()))
    }
}

fn transport(open_id: OpenId, event: TransportEvent) -> ChannelEvent {
    ChannelEvent::Transport { open_id, event }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
