//! In-memory channel and REST fakes shared by the integration tests.

#![allow(dead_code)]

use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;
use tidewire_client::{Channel, ChannelEvent, OpenRequest, RestApi};
use tidewire_core::{Ack, ConnectionError, ConversationKey, OutboundAction, SendError};
use tokio::sync::{mpsc, oneshot};

/// Records everything and lets the test answer acks by hand.
#[derive(Default)]
pub struct MockChannel {
    connected: AtomicBool,
    binds: AtomicUsize,
    sink: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
    opens: Mutex<Vec<OpenRequest>>,
    closes: Mutex<Vec<String>>,
    emitted: Mutex<Vec<OutboundAction>>,
    acks: Mutex<Vec<oneshot::Sender<Ack>>>,
}

impl MockChannel {
    pub fn connected() -> Self {
        let channel = Self::default();
        channel.set_connected(true);
        channel
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> Vec<OpenRequest> {
        self.opens.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.closes.lock().unwrap().clone()
    }

    pub fn emitted(&self) -> Vec<OutboundAction> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn sink(&self) -> mpsc::Sender<ChannelEvent> {
        self.sink.lock().unwrap().clone().expect("handlers bound")
    }

    /// Answer the oldest outstanding ack. Returns false if nobody is
    /// listening any more.
    pub fn ack_next(&self, ack: Ack) -> bool {
        let mut acks = self.acks.lock().unwrap();
        if acks.is_empty() {
            return false;
        }
        acks.remove(0).send(ack).is_ok()
    }

    /// Drop every outstanding ack sender.
    pub fn drop_acks(&self) {
        self.acks.lock().unwrap().clear();
    }
}

impl Channel for MockChannel {
    fn bind(&self, sink: mpsc::Sender<ChannelEvent>) {
        self.binds.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn open(&self, request: OpenRequest) {
        self.opens.lock().unwrap().push(request);
    }

    fn close(&self, reason: &str) {
        self.closes.lock().unwrap().push(reason.to_string());
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, action: &OutboundAction) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.emitted.lock().unwrap().push(action.clone());
        Ok(())
    }

    fn emit_with_ack(
        &self,
        action: &OutboundAction,
    ) -> Result<oneshot::Receiver<Ack>, ConnectionError> {
        self.emit(action)?;
        let (tx, rx) = oneshot::channel();
        self.acks.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// REST fake with a canned append response and a canned history page.
pub struct MockRest {
    calls: AtomicUsize,
    response: Mutex<Result<Value, SendError>>,
    history: Mutex<Vec<Value>>,
    credential: Mutex<Option<String>>,
    sent_with: Mutex<Vec<Option<String>>>,
}

impl MockRest {
    pub fn answering(response: Value) -> Self {
        Self::with_response(Ok(response))
    }

    pub fn failing(reason: &str) -> Self {
        Self::with_response(Err(SendError::Rest(reason.to_string())))
    }

    fn with_response(response: Result<Value, SendError>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: Mutex::new(response),
            history: Mutex::new(Vec::new()),
            credential: Mutex::new(None),
            sent_with: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history(self, page: Vec<Value>) -> Self {
        *self.history.lock().unwrap() = page;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_answer(&self, response: Value) {
        *self.response.lock().unwrap() = Ok(response);
    }

    /// Credential in effect for each append, in call order.
    pub fn sent_with(&self) -> Vec<Option<String>> {
        self.sent_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl RestApi for MockRest {
    async fn append_message(
        &self,
        _conversation: &ConversationKey,
        _body: &Value,
    ) -> Result<Value, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let credential = self.credential.lock().unwrap().clone();
        self.sent_with.lock().unwrap().push(credential);
        self.response.lock().unwrap().clone()
    }

    fn set_credential(&self, credential: Option<String>) {
        *self.credential.lock().unwrap() = credential;
    }

    async fn list_messages(
        &self,
        _conversation: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<Value>, SendError> {
        Ok(self.history.lock().unwrap().iter().take(limit).cloned().collect())
    }
}
