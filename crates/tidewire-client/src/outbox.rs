//! Send coordinator: realtime first, REST as fallback.
//!
//! # Architecture
//!
//! Each [`Outbox::send`] runs one attempt through [`SendAttempt`]:
//!
//! 1. Record a [`PendingSend`] in the snapshot outbox (optimistic echo).
//! 2. Emit over the [`Channel`] with an ack receiver and race it against
//!    [`Environment::sleep`] of `ack_timeout`. Losing the race drops the
//!    receiver; the channel discards a late ack, so a straggler cannot
//!    confirm or deliver anything.
//! 3. If the ack did not confirm, POST through [`RestApi`].
//!
//! Every persisted message body (embedded in the ack, or returned by REST)
//! goes through the [`Reconciler`], the same path pushes take, so the
//! conversation holds it once no matter how many paths deliver it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::{Value, json};
use tidewire_core::{
    Ack, ConversationKey, DeliveryPath, Environment, MediaRefs, Message, OutboundAction,
    PendingSend, Reconciler, SendAttempt, SendError, SendState,
};
use tokio::sync::oneshot;

use crate::channel::{Channel, RestApi};

/// Outcome of one [`Outbox::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    /// Local correlation id of the attempt
    pub local_id: String,
    /// Target conversation
    pub conversation: ConversationKey,
    /// Terminal state: `Confirmed` or `Failed`
    pub state: SendState,
    /// Every state visited, starting at `Created`
    pub transitions: Vec<SendState>,
    /// Message newly inserted by this attempt. `None` when a push delivered
    /// it first, or when the send failed.
    pub message: Option<Message>,
    /// Why the send failed
    pub error: Option<SendError>,
}

/// Send coordinator shared by every in-flight send.
pub struct Outbox<E, C, R> {
    env: E,
    channel: Arc<C>,
    rest: Arc<R>,
    reconciler: Reconciler,
    ack_timeout: Duration,
    sequence: Arc<AtomicU64>,
}

impl<E: Clone, C, R> Clone for Outbox<E, C, R> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            channel: Arc::clone(&self.channel),
            rest: Arc::clone(&self.rest),
            reconciler: self.reconciler.clone(),
            ack_timeout: self.ack_timeout,
            sequence: Arc::clone(&self.sequence),
        }
    }
}

impl<E, C, R> std::fmt::Debug for Outbox<E, C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").field("ack_timeout", &self.ack_timeout).finish_non_exhaustive()
    }
}

impl<E, C, R> Outbox<E, C, R>
where
    E: Environment,
    C: Channel,
    R: RestApi,
{
    /// Coordinator writing through `reconciler`.
    pub fn new(
        env: E,
        channel: Arc<C>,
        rest: Arc<R>,
        reconciler: Reconciler,
        ack_timeout: Duration,
    ) -> Self {
        Self { env, channel, rest, reconciler, ack_timeout, sequence: Arc::new(AtomicU64::new(0)) }
    }

    /// Send a message. Never fails; the outcome is in the report.
    pub async fn send(
        &self,
        conversation: ConversationKey,
        text: impl Into<String>,
        media: MediaRefs,
    ) -> SendReport {
        let text = text.into();
        let store = self.reconciler.store();
        let mut pending = PendingSend {
            local_id: self.next_local_id(),
            conversation: conversation.clone(),
            text: text.clone(),
            media: media.clone(),
            created_at: self.env.wall_clock_ms(),
            state: SendState::Created,
        };
        store.upsert_pending(pending.clone());

        let mut attempt = SendAttempt::new();
        let mut message = None;
        let action = OutboundAction::send_message(&conversation, text.clone(), media.clone());

        let realtime = match self.channel.emit_with_ack(&action) {
            Ok(receiver) => {
                self.advance(&mut attempt, &mut pending, SendState::SentRealtime);
                self.await_ack(receiver).await
            },
            Err(err) => Err(SendError::from(err)),
        };

        let realtime_error = match realtime {
            Ok(ack) => {
                if let Some(raw) = &ack.message {
                    message = self.deliver(&conversation, raw, DeliveryPath::Ack);
                }
                if ack.ok {
                    self.advance(&mut attempt, &mut pending, SendState::Acked);
                    self.advance(&mut attempt, &mut pending, SendState::Confirmed);
                    store.remove_pending(&pending.local_id);
                    return report(pending, attempt, message, None);
                }
                SendError::AckRejected(ack.error.unwrap_or_else(|| "unknown".to_string()))
            },
            Err(err) => err,
        };

        if matches!(realtime_error, SendError::AckTimeout(_)) {
            self.advance(&mut attempt, &mut pending, SendState::TimedOut);
        }
        tracing::debug!(
            local_id = %pending.local_id,
            reason = %realtime_error,
            "falling back to rest"
        );
        self.advance(&mut attempt, &mut pending, SendState::FallbackRest);

        let body =
            json!({ "text": text, "mediaUrls": media.media_urls, "mediaIds": media.media_ids });
        match self.rest.append_message(&conversation, &body).await {
            Ok(response) => {
                let raw = response.get("message").filter(|m| m.is_object()).unwrap_or(&response);
                let delivered = self.deliver(&conversation, raw, DeliveryPath::Rest);
                message = message.or(delivered);
                self.advance(&mut attempt, &mut pending, SendState::Confirmed);
                store.remove_pending(&pending.local_id);
                report(pending, attempt, message, None)
            },
            Err(rest_error) => {
                self.advance(&mut attempt, &mut pending, SendState::Failed);
                tracing::warn!(
                    local_id = %pending.local_id,
                    conversation = %conversation,
                    realtime = %realtime_error,
                    rest = %rest_error,
                    "send failed"
                );
                let error = SendError::Failed {
                    realtime: Box::new(realtime_error),
                    rest: Box::new(rest_error),
                };
                report(pending, attempt, message, Some(error))
            },
        }
    }

    /// Emit an ack-bearing action other than a message send.
    ///
    /// # Errors
    ///
    /// - `SendError::ChannelUnavailable` if the channel refused to emit
    /// - `SendError::AckTimeout` / `SendError::AckDropped` if no ack came back
    /// - `SendError::AckRejected` if the server answered `ok: false`
    pub async fn request(&self, action: &OutboundAction) -> Result<Ack, SendError> {
        let receiver = self.channel.emit_with_ack(action)?;
        let ack = self.await_ack(receiver).await?;
        if ack.ok {
            Ok(ack)
        } else {
            Err(SendError::AckRejected(ack.error.unwrap_or_else(|| "unknown".to_string())))
        }
    }

    /// Fetch recent messages and merge them into the store. Returns how many
    /// were new.
    ///
    /// # Errors
    ///
    /// - `SendError::Rest` if the request failed
    pub async fn fetch_history(
        &self,
        conversation: &ConversationKey,
        limit: usize,
    ) -> Result<usize, SendError> {
        let page = self.rest.list_messages(conversation, limit).await?;
        let now_ms = self.env.wall_clock_ms();
        let inserted = self.reconciler.deliver_history(conversation, &page, now_ms);
        tracing::debug!(%conversation, received = page.len(), inserted, "history fetched");
        Ok(inserted)
    }

    fn next_local_id(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("local-{:016x}-{sequence}", self.env.random_u64())
    }

    async fn await_ack(&self, receiver: oneshot::Receiver<Ack>) -> Result<Ack, SendError> {
        tokio::select! {
            ack = receiver => ack.map_err(|_| SendError::AckDropped),
            () = self.env.sleep(self.ack_timeout) => Err(SendError::AckTimeout(self.ack_timeout)),
        }
    }

    fn deliver(
        &self,
        conversation: &ConversationKey,
        raw: &Value,
        path: DeliveryPath,
    ) -> Option<Message> {
        self.reconciler.deliver(conversation.clone(), raw, path, self.env.wall_clock_ms())
    }

    fn advance(&self, attempt: &mut SendAttempt, pending: &mut PendingSend, next: SendState) {
        if let Err(err) = attempt.advance(next) {
            tracing::warn!(local_id = %pending.local_id, %err, "send transition rejected");
            return;
        }
        pending.state = next;
        if !next.is_terminal() || next == SendState::Failed {
            self.reconciler.store().upsert_pending(pending.clone());
        }
    }
}

fn report(
    pending: PendingSend,
    attempt: SendAttempt,
    message: Option<Message>,
    error: Option<SendError>,
) -> SendReport {
    SendReport {
        local_id: pending.local_id,
        conversation: pending.conversation,
        state: attempt.state(),
        transitions: attempt.history().to_vec(),
        message,
        error,
    }
}
