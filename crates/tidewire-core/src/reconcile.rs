//! Single identity path for every message delivery.
//!
//! A message authored here may become visible through the ack body, the live
//! push, and the REST fallback response, in any order. All of them go through
//! [`Reconciler::deliver`]: normalize, admit through the [`DedupWindow`], then
//! insert with the store's id-uniqueness rule. The first path to arrive wins;
//! the rest are no-ops.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::{
    dedup::{DedupConfig, DedupKey, DedupWindow},
    message::{ConversationKey, Message, normalize},
    store::Store,
};

/// Where a message payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Live server push
    Push,
    /// Embedded in an ack for our own send
    Ack,
    /// REST fallback response
    Rest,
    /// History page; bypasses the dedup window since pages legitimately
    /// repeat messages already seen live
    History,
}

/// Shared dedup window plus store.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Store,
    window: Arc<Mutex<DedupWindow>>,
}

impl Reconciler {
    /// Reconciler writing into `store`.
    pub fn new(store: Store, config: DedupConfig) -> Self {
        Self { store, window: Arc::new(Mutex::new(DedupWindow::new(config))) }
    }

    /// Store this reconciler writes into.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Deliver a raw payload. Returns the message only if it was newly
    /// inserted.
    pub fn deliver(
        &self,
        conversation: ConversationKey,
        raw: &Value,
        path: DeliveryPath,
        now_ms: i64,
    ) -> Option<Message> {
        let message = normalize(conversation, raw, now_ms);

        if path != DeliveryPath::History {
            let key = DedupKey::message(&message.conversation, &message.id);
            if !self.admit(key, now_ms) {
                tracing::debug!(
                    conversation = %message.conversation,
                    message_id = %message.id,
                    ?path,
                    "duplicate delivery dropped"
                );
                return None;
            }
        }

        if !self.store.insert_message(message.clone()) {
            // Outlived the dedup window but still present in the conversation
            tracing::debug!(message_id = %message.id, ?path, "message already stored");
            return None;
        }

        tracing::debug!(
            conversation = %message.conversation,
            message_id = %message.id,
            ?path,
            "message stored"
        );
        Some(message)
    }

    /// Deliver a history page. Returns how many messages were new.
    pub fn deliver_history(
        &self,
        conversation: &ConversationKey,
        page: &[Value],
        now_ms: i64,
    ) -> usize {
        let messages =
            page.iter().map(|raw| normalize(conversation.clone(), raw, now_ms)).collect();
        self.store.merge_history(messages)
    }

    /// Admit a non-message event (call ring, invite) through the same window.
    pub fn admit_event(&self, key: DedupKey, now_ms: i64) -> bool {
        self.admit(key, now_ms)
    }

    /// Number of keys tracked by the dedup window.
    pub fn window_len(&self) -> usize {
        self.window.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn admit(&self, key: DedupKey, now_ms: i64) -> bool {
        self.window.lock().unwrap_or_else(PoisonError::into_inner).admit(key, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn reconciler() -> Reconciler {
        Reconciler::new(Store::default(), DedupConfig::default())
    }

    #[test]
    fn every_path_converges_on_one_entry() {
        let rec = reconciler();
        let r1 = ConversationKey::room("r1");
        let raw = json!({ "id": "srv-1", "ts": 100, "text": "hi" });

        assert!(rec.deliver(r1.clone(), &raw, DeliveryPath::Ack, 100).is_some());
        assert!(rec.deliver(r1.clone(), &raw, DeliveryPath::Push, 150).is_none());
        assert!(rec.deliver(r1.clone(), &raw, DeliveryPath::Rest, 200).is_none());
        assert_eq!(rec.store().snapshot().messages(&r1).len(), 1);
    }

    #[test]
    fn store_uniqueness_outlives_dedup_ttl() {
        let rec = reconciler();
        let r1 = ConversationKey::room("r1");
        let raw = json!({ "id": "m1", "ts": 1 });
        assert!(rec.deliver(r1.clone(), &raw, DeliveryPath::Push, 0).is_some());
        // Past the 15s window the key is re-admitted, the store still refuses
        assert!(rec.deliver(r1.clone(), &raw, DeliveryPath::Push, 60_000).is_none());
        assert_eq!(rec.store().snapshot().messages(&r1).len(), 1);
    }

    #[test]
    fn history_skips_window_but_not_uniqueness() {
        let rec = reconciler();
        let r1 = ConversationKey::room("r1");
        rec.deliver(r1.clone(), &json!({ "id": "m2", "ts": 2 }), DeliveryPath::Push, 0);
        let page = [json!({ "id": "m1", "ts": 1 }), json!({ "id": "m2", "ts": 2 })];
        assert_eq!(rec.deliver_history(&r1, &page, 0), 1);
        assert_eq!(rec.window_len(), 1);
        let snapshot = rec.store().snapshot();
        let ids: Vec<_> = snapshot.messages(&r1).iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn synthesized_ids_dedup_redelivery() {
        let rec = reconciler();
        let dm = ConversationKey::direct("t1");
        let raw = json!({ "ts": 10, "text": "no id", "from": "bob" });
        assert!(rec.deliver(dm.clone(), &raw, DeliveryPath::Push, 10).is_some());
        assert!(rec.deliver(dm.clone(), &raw, DeliveryPath::Push, 20).is_none());
    }
}
