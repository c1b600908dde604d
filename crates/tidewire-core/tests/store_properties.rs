//! Property-based tests for the store and reconciler.
//!
//! Arbitrary interleavings of deliveries across every path must leave each
//! conversation sorted by timestamp with at most one entry per id.

use std::collections::HashSet;

use proptest::prelude::*;
use serde_json::json;
use tidewire_core::{ConversationKey, DedupConfig, DeliveryPath, Reconciler, Snapshot, Store};

#[derive(Debug, Clone)]
struct Delivery {
    conversation: ConversationKey,
    id: Option<u8>,
    ts: i64,
    text: u8,
    path: DeliveryPath,
    at_ms: i64,
}

fn conversation_strategy() -> impl Strategy<Value = ConversationKey> {
    prop_oneof![
        2 => (0u8..3).prop_map(|n| ConversationKey::room(format!("r{n}"))),
        1 => (0u8..2).prop_map(|n| ConversationKey::direct(format!("t{n}"))),
    ]
}

fn path_strategy() -> impl Strategy<Value = DeliveryPath> {
    prop_oneof![
        3 => Just(DeliveryPath::Push),
        1 => Just(DeliveryPath::Ack),
        1 => Just(DeliveryPath::Rest),
        1 => Just(DeliveryPath::History),
    ]
}

fn delivery_strategy() -> impl Strategy<Value = Delivery> {
    (
        conversation_strategy(),
        prop::option::weighted(0.8, 0u8..20),
        0i64..10_000,
        0u8..4,
        path_strategy(),
        0i64..60_000,
    )
        .prop_map(|(conversation, id, ts, text, path, at_ms)| Delivery {
            conversation,
            id,
            ts,
            text,
            path,
            at_ms,
        })
}

fn deliver(rec: &Reconciler, d: &Delivery) {
    let mut raw = json!({ "ts": d.ts, "text": format!("text-{}", d.text), "from": "peer" });
    if let Some(id) = d.id {
        raw["id"] = json!(format!("m{id}"));
    }
    if d.path == DeliveryPath::History {
        rec.deliver_history(&d.conversation, &[raw], d.at_ms);
    } else {
        rec.deliver(d.conversation.clone(), &raw, d.path, d.at_ms);
    }
}

/// Every conversation sorted ascending, no id twice.
fn check_conversations(snapshot: &Snapshot) -> Result<(), String> {
    for (key, messages) in &snapshot.conversations {
        if let Some(pair) = messages.windows(2).find(|w| w[0].timestamp > w[1].timestamp) {
            return Err(format!("{key}: {} after {}", pair[1].id, pair[0].id));
        }
        let mut seen = HashSet::new();
        for message in messages {
            if !seen.insert(&message.id) {
                return Err(format!("{key}: duplicate id {}", message.id));
            }
            if message.conversation != *key {
                return Err(format!("{key}: holds message of {}", message.conversation));
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_conversations_stay_sorted_and_unique(
        deliveries in prop::collection::vec(delivery_strategy(), 0..120)
    ) {
        let rec = Reconciler::new(Store::default(), DedupConfig::default());
        for d in &deliveries {
            deliver(&rec, d);
            let snapshot = rec.store().snapshot();
            let checked = check_conversations(&snapshot);
            prop_assert!(checked.is_ok(), "{:?}", checked);
        }
    }

    #[test]
    fn prop_same_message_via_any_paths_is_stored_once(
        paths in prop::collection::vec(path_strategy(), 1..12),
        offsets in prop::collection::vec(0i64..15_000, 12),
    ) {
        let rec = Reconciler::new(Store::default(), DedupConfig::default());
        let r1 = ConversationKey::room("r1");
        for (path, offset) in paths.iter().zip(&offsets) {
            let d = Delivery {
                conversation: r1.clone(),
                id: Some(1),
                ts: 1000,
                text: 0,
                path: *path,
                at_ms: *offset,
            };
            deliver(&rec, &d);
        }
        prop_assert_eq!(rec.store().snapshot().messages(&r1).len(), 1);
    }

    #[test]
    fn prop_insertion_order_does_not_matter(
        mut stamps in prop::collection::vec(0i64..1_000, 1..40)
    ) {
        let forward = Store::default();
        let reverse = Store::default();
        let r1 = ConversationKey::room("r1");

        stamps.sort_unstable();
        stamps.dedup();
        for (n, ts) in stamps.iter().enumerate() {
            forward.append_message(r1.clone(), &json!({ "id": format!("m{n}"), "ts": ts }), 0);
        }
        for (n, ts) in stamps.iter().enumerate().rev() {
            reverse.append_message(r1.clone(), &json!({ "id": format!("m{n}"), "ts": ts }), 0);
        }

        let ids = |store: &Store| -> Vec<String> {
            store.snapshot().messages(&r1).iter().map(|m| m.id.to_string()).collect()
        };
        prop_assert_eq!(ids(&forward), ids(&reverse));
    }
}

#[test]
fn append_twice_keeps_one() {
    let store = Store::default();
    let r1 = ConversationKey::room("r1");
    store.append_message(r1.clone(), &json!({ "id": "m1", "ts": 1000 }), 0);
    store.append_message(r1.clone(), &json!({ "id": "m1", "ts": 1000 }), 0);
    assert_eq!(store.snapshot().messages(&r1).len(), 1);
}

#[test]
fn late_older_message_sorts_first() {
    let store = Store::default();
    let r1 = ConversationKey::room("r1");
    store.append_message(r1.clone(), &json!({ "id": "m2", "ts": 2000 }), 0);
    store.append_message(r1.clone(), &json!({ "id": "m1", "ts": 1000 }), 0);
    let ids: Vec<_> = store.snapshot().messages(&r1).iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}
