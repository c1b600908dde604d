//! Conversation state store: the only mutator of the [`Snapshot`].
//!
//! Every change is a whole-object patch: the store builds a new snapshot from
//! the current one plus a [`SnapshotPatch`], swaps it in, and then notifies
//! subscribers synchronously with the new `Arc<Snapshot>`. Subscribers only
//! ever see shared immutable snapshots, so they cannot mutate state behind the
//! store's back.
//!
//! # Components
//!
//! - [`Store`]: cloneable handle, cheap to pass to every component
//! - [`Subscription`]: guard returned by [`Store::subscribe`]; dropping it
//!   unsubscribes
//!
//! Subscribers are invoked after the internal lock is released, so a
//! subscriber may read the store or even patch it again.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use serde_json::Value;

use crate::{
    message::{ConversationKey, Message, MessageId, normalize},
    send::PendingSend,
    snapshot::{
        CallInfo, ChannelStatus, DEFAULT_NOTIFICATION_CAP, Notification, NotificationDraft,
        RoomSummary, Snapshot, SnapshotPatch,
    },
};

/// Subscriber callback.
pub type Subscriber = Arc<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

struct Inner {
    snapshot: Arc<Snapshot>,
    subscribers: Vec<(u64, Subscriber)>,
    next_subscriber: u64,
}

/// Handle to the single source of truth.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
    notification_cap: usize,
}

impl Store {
    /// Empty store with the given notification ring capacity.
    pub fn new(notification_cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                snapshot: Arc::new(Snapshot::default()),
                subscribers: Vec::new(),
                next_subscriber: 0,
            })),
            notification_cap: notification_cap.max(1),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.lock().snapshot)
    }

    /// Merge `patch` into a new snapshot and notify subscribers.
    pub fn patch(&self, patch: SnapshotPatch) -> Arc<Snapshot> {
        self.patch_with(|_| patch)
    }

    /// Like [`Store::patch`], with the patch computed from the current
    /// snapshot under the lock.
    pub fn patch_with<F>(&self, f: F) -> Arc<Snapshot>
    where
        F: FnOnce(&Snapshot) -> SnapshotPatch,
    {
        self.update(|current| Some(f(current))).unwrap_or_else(|| self.snapshot())
    }

    /// Register `subscriber` and invoke it once with the current snapshot.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(subscriber);
        let (id, current) = {
            let mut inner = self.lock();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.push((id, Arc::clone(&subscriber)));
            (id, Arc::clone(&inner.snapshot))
        };

        subscriber(&current);
        Subscription { store: Arc::downgrade(&self.inner), id: Some(id) }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Normalize `raw` into `conversation` and insert it.
    ///
    /// Returns the message if it was inserted, `None` if a message with the
    /// same id already exists.
    pub fn append_message(
        &self,
        conversation: ConversationKey,
        raw: &Value,
        now_ms: i64,
    ) -> Option<Message> {
        let message = normalize(conversation, raw, now_ms);
        self.insert_message(message.clone()).then_some(message)
    }

    /// Insert an already-normalized message.
    ///
    /// No-op if the conversation already holds the id; otherwise the message
    /// is placed so the list stays ascending by timestamp. Equal timestamps
    /// keep arrival order.
    pub fn insert_message(&self, message: Message) -> bool {
        self.update(|current| {
            let mut conversations = current.conversations.clone();
            insert_sorted(&mut conversations, message).then(|| SnapshotPatch {
                conversations: Some(conversations),
                ..SnapshotPatch::default()
            })
        })
        .is_some()
    }

    /// Insert a page of history through the same uniqueness and ordering rule
    /// as live messages. Returns how many were new.
    pub fn merge_history(&self, messages: Vec<Message>) -> usize {
        let mut inserted = 0;
        self.update(|current| {
            let mut conversations = current.conversations.clone();
            for message in messages {
                if insert_sorted(&mut conversations, message) {
                    inserted += 1;
                }
            }
            (inserted > 0).then(|| SnapshotPatch {
                conversations: Some(conversations),
                ..SnapshotPatch::default()
            })
        });
        inserted
    }

    /// Replace the participant set of `room` wholesale.
    pub fn set_presence(&self, room: &str, participants: Vec<String>) {
        self.patch_with(|current| {
            let mut presence = current.presence.clone();
            presence.insert(room.to_string(), participants);
            SnapshotPatch { presence: Some(presence), ..SnapshotPatch::default() }
        });
    }

    /// Set one participant's typing flag; the room's map is replaced with the
    /// updated copy.
    pub fn set_typing(&self, room: &str, participant: &str, is_typing: bool) {
        self.patch_with(|current| {
            let mut typing = current.typing.clone();
            let mut room_map = typing.get(room).cloned().unwrap_or_default();
            room_map.insert(participant.to_string(), is_typing);
            typing.insert(room.to_string(), room_map);
            SnapshotPatch { typing: Some(typing), ..SnapshotPatch::default() }
        });
    }

    /// Prepend a notification, truncating the ring to its cap.
    ///
    /// Returns false (and leaves the snapshot alone) if the resolved id is
    /// already present.
    pub fn push_notification(&self, draft: NotificationDraft) -> bool {
        let notification = Notification::from(draft);
        let cap = self.notification_cap;
        self.update(|current| {
            if current.notifications.iter().any(|n| n.id == notification.id) {
                return None;
            }
            let mut notifications = Vec::with_capacity(cap);
            notifications.push(notification);
            notifications.extend(current.notifications.iter().take(cap - 1).cloned());
            Some(SnapshotPatch { notifications: Some(notifications), ..SnapshotPatch::default() })
        })
        .is_some()
    }

    /// Flag every notification as read.
    pub fn mark_all_notifications_read(&self) {
        self.update(|current| {
            if current.notifications.iter().all(|n| n.read) {
                return None;
            }
            let notifications = current
                .notifications
                .iter()
                .cloned()
                .map(|n| Notification { read: true, ..n })
                .collect();
            Some(SnapshotPatch { notifications: Some(notifications), ..SnapshotPatch::default() })
        });
    }

    /// Set the focused conversation and, for direct threads, the peer.
    pub fn set_focus(&self, focus: Option<ConversationKey>, active_peer: Option<String>) {
        self.patch(SnapshotPatch {
            focus: Some(focus),
            active_peer: Some(active_peer),
            ..SnapshotPatch::default()
        });
    }

    /// Record our own participant id.
    pub fn set_self_id(&self, self_id: Option<String>) {
        self.patch(SnapshotPatch { self_id: Some(self_id), ..SnapshotPatch::default() });
    }

    /// Set or clear the ringing call.
    pub fn set_incoming_call(&self, call: Option<CallInfo>) {
        self.patch(SnapshotPatch { incoming_call: Some(call), ..SnapshotPatch::default() });
    }

    /// Set or clear the active call.
    pub fn set_active_call(&self, call: Option<CallInfo>) {
        self.patch(SnapshotPatch { active_call: Some(call), ..SnapshotPatch::default() });
    }

    /// Publish the channel status if it changed.
    pub fn set_channel_status(&self, status: ChannelStatus) {
        self.update(|current| {
            (current.channel_status != status)
                .then(|| SnapshotPatch { channel_status: Some(status), ..SnapshotPatch::default() })
        });
    }

    /// Insert or rename rooms, keyed by id.
    pub fn upsert_rooms(&self, rooms: Vec<RoomSummary>) {
        self.patch_with(|current| {
            let mut merged = current.rooms.clone();
            for room in rooms {
                match merged.iter_mut().find(|existing| existing.id == room.id) {
                    Some(existing) => *existing = room,
                    None => merged.push(room),
                }
            }
            SnapshotPatch { rooms: Some(merged), ..SnapshotPatch::default() }
        });
    }

    /// Insert or replace an outbox entry, keyed by local id.
    pub fn upsert_pending(&self, pending: PendingSend) {
        self.patch_with(|current| {
            let mut outbox = current.outbox.clone();
            match outbox.iter_mut().find(|p| p.local_id == pending.local_id) {
                Some(existing) => *existing = pending,
                None => outbox.push(pending),
            }
            SnapshotPatch { outbox: Some(outbox), ..SnapshotPatch::default() }
        });
    }

    /// Drop an outbox entry.
    pub fn remove_pending(&self, local_id: &str) {
        self.update(|current| {
            let outbox: Vec<PendingSend> =
                current.outbox.iter().filter(|p| p.local_id != local_id).cloned().collect();
            (outbox.len() != current.outbox.len())
                .then(|| SnapshotPatch { outbox: Some(outbox), ..SnapshotPatch::default() })
        });
    }

    /// Returns true if `conversation` already holds `id`.
    pub fn contains_message(&self, conversation: &ConversationKey, id: &MessageId) -> bool {
        self.snapshot().messages(conversation).iter().any(|m| &m.id == id)
    }

    /// Apply a patch computed under the lock; `None` means nothing changed and
    /// nobody is notified.
    fn update<F>(&self, f: F) -> Option<Arc<Snapshot>>
    where
        F: FnOnce(&Snapshot) -> Option<SnapshotPatch>,
    {
        let (next, subscribers) = {
            let mut inner = self.lock();
            let patch = f(&inner.snapshot)?;
            let next = Arc::new(inner.snapshot.apply(patch));
            inner.snapshot = Arc::clone(&next);
            let subscribers: Vec<Subscriber> =
                inner.subscribers.iter().map(|(_, s)| Arc::clone(s)).collect();
            (next, subscribers)
        };

        for subscriber in subscribers {
            subscriber(&next);
        }
        Some(next)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAP)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("notification_cap", &self.notification_cap)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// Insert keeping ascending timestamp order; false if the id already exists.
fn insert_sorted(
    conversations: &mut HashMap<ConversationKey, Vec<Message>>,
    message: Message,
) -> bool {
    let list = conversations.entry(message.conversation.clone()).or_default();
    if list.iter().any(|m| m.id == message.id) {
        return false;
    }
    let at = list.partition_point(|m| m.timestamp <= message.timestamp);
    list.insert(at, message);
    true
}

/// Registration guard returned by [`Store::subscribe`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<Mutex<Inner>>,
    id: Option<u64>,
}

impl Subscription {
    /// Stop receiving snapshots.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the subscriber registered for the store's lifetime.
    pub fn detach(mut self) {
        self.id = None;
    }

    fn release(&mut self) {
        if let (Some(id), Some(store)) = (self.id.take(), self.store.upgrade()) {
            let mut inner = store.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.retain(|(sid, _)| *sid != id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::snapshot::NotificationKind;

    fn r1() -> ConversationKey {
        ConversationKey::room("r1")
    }

    fn ids(store: &Store, key: &ConversationKey) -> Vec<String> {
        store.snapshot().messages(key).iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn appending_same_id_twice_keeps_one() {
        let store = Store::default();
        assert!(store.append_message(r1(), &json!({ "id": "m1", "ts": 1000 }), 0).is_some());
        assert!(store.append_message(r1(), &json!({ "id": "m1", "ts": 1000 }), 0).is_none());
        assert_eq!(store.snapshot().messages(&r1()).len(), 1);
    }

    #[test]
    fn out_of_order_arrival_self_heals() {
        let store = Store::default();
        store.append_message(r1(), &json!({ "id": "m2", "ts": 2000 }), 0);
        store.append_message(r1(), &json!({ "id": "m1", "ts": 1000 }), 0);
        assert_eq!(ids(&store, &r1()), vec!["m1", "m2"]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let store = Store::default();
        for id in ["a", "b", "c"] {
            store.append_message(r1(), &json!({ "id": id, "ts": 5 }), 0);
        }
        assert_eq!(ids(&store, &r1()), vec!["a", "b", "c"]);
    }

    #[test]
    fn same_id_in_different_conversations_is_allowed() {
        let store = Store::default();
        let dm = ConversationKey::direct("t1");
        assert!(store.append_message(r1(), &json!({ "id": "m1" }), 0).is_some());
        assert!(store.append_message(dm.clone(), &json!({ "id": "m1" }), 0).is_some());
        assert_eq!(ids(&store, &dm), vec!["m1"]);
    }

    #[test]
    fn history_merges_without_duplicates() {
        let store = Store::default();
        store.append_message(r1(), &json!({ "id": "m3", "ts": 3000 }), 0);
        let page = [("m1", 1000), ("m3", 3000), ("m2", 2000)]
            .into_iter()
            .map(|(id, ts)| normalize(r1(), &json!({ "id": id, "ts": ts }), 0))
            .collect();
        assert_eq!(store.merge_history(page), 2);
        assert_eq!(ids(&store, &r1()), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn subscribe_delivers_current_state_immediately() {
        let store = Store::default();
        store.append_message(r1(), &json!({ "id": "m1" }), 0);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = store.subscribe(move |snap| {
            counter.fetch_add(snap.messages(&ConversationKey::room("r1")).len(), Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        store.append_message(r1(), &json!({ "id": "m2" }), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        sub.unsubscribe();
        store.append_message(r1(), &json!({ "id": "m3" }), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn duplicate_append_notifies_nobody() {
        let store = Store::default();
        store.append_message(r1(), &json!({ "id": "m1" }), 0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.append_message(r1(), &json!({ "id": "m1" }), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let store = Store::default();
        {
            let _sub = store.subscribe(|_| {});
            assert_eq!(store.subscriber_count(), 1);
        }
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_may_reenter_store() {
        let store = Store::default();
        let inner = store.clone();
        let _sub = store.subscribe(move |snap| {
            if snap.focus.is_some() && snap.active_peer.is_none() {
                inner.set_focus(snap.focus.clone(), Some("peer".into()));
            }
        });
        store.set_focus(Some(r1()), None);
        assert_eq!(store.snapshot().active_peer.as_deref(), Some("peer"));
    }

    #[test]
    fn presence_is_replaced_wholesale() {
        let store = Store::default();
        store.set_presence("r1", vec!["a".into(), "b".into()]);
        store.set_presence("r1", vec!["c".into()]);
        assert_eq!(store.snapshot().presence["r1"], vec!["c".to_string()]);
    }

    #[test]
    fn typing_is_keyed_per_participant() {
        let store = Store::default();
        store.set_typing("r1", "a", true);
        store.set_typing("r1", "b", true);
        store.set_typing("r1", "a", false);
        let snap = store.snapshot();
        assert!(!snap.typing["r1"]["a"]);
        assert!(snap.typing["r1"]["b"]);
    }

    #[test]
    fn notifications_are_newest_first_capped_and_unique() {
        let store = Store::new(3);
        for ts in 0..5 {
            let draft = NotificationDraft::new(NotificationKind::Room, "msg", ts);
            assert!(store.push_notification(draft));
        }
        assert!(!store.push_notification(NotificationDraft::new(NotificationKind::Room, "msg", 4)));

        let snap = store.snapshot();
        let stamps: Vec<i64> = snap.notifications.iter().map(|n| n.ts).collect();
        assert_eq!(stamps, vec![4, 3, 2]);
        assert_eq!(snap.unread_notifications(), 3);

        store.mark_all_notifications_read();
        assert_eq!(store.snapshot().unread_notifications(), 0);
    }

    #[test]
    fn outbox_entries_are_keyed_by_local_id() {
        use crate::{message::MediaRefs, send::SendState};

        let store = Store::default();
        let pending = PendingSend {
            local_id: "local-1".into(),
            conversation: r1(),
            text: "hi".into(),
            media: MediaRefs::default(),
            created_at: 0,
            state: SendState::Created,
        };
        store.upsert_pending(pending.clone());
        store.upsert_pending(PendingSend { state: SendState::SentRealtime, ..pending });
        assert_eq!(store.snapshot().outbox.len(), 1);
        assert_eq!(store.snapshot().outbox[0].state, SendState::SentRealtime);

        store.remove_pending("local-1");
        assert!(store.snapshot().outbox.is_empty());
    }
}
