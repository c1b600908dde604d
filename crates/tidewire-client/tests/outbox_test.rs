//! Send coordinator tests under virtual time.
//!
//! The ack-versus-timeout race is the part of the client that is easiest to
//! get wrong and hardest to observe in production, so each outcome of the
//! race gets its own test: ack in time, timeout, negative ack, dropped ack,
//! and both paths failing.

mod common;

use std::{sync::Arc, time::Duration};

use common::{MockChannel, MockRest};
use serde_json::{Value, json};
use tidewire_client::Outbox;
use tidewire_core::{
    Ack, ConversationKey, DedupConfig, DeliveryPath, Environment, MediaRefs, Message,
    OutboundAction, Reconciler, SendError, SendState, Store, env::test_utils::MockEnv,
};

const ACK_TIMEOUT: Duration = Duration::from_millis(1800);

struct Fixture {
    env: MockEnv,
    channel: Arc<MockChannel>,
    rest: Arc<MockRest>,
    reconciler: Reconciler,
    outbox: Outbox<MockEnv, MockChannel, MockRest>,
}

impl Fixture {
    fn new(channel: MockChannel, rest: MockRest) -> Self {
        let env = MockEnv::new();
        let channel = Arc::new(channel);
        let rest = Arc::new(rest);
        let reconciler = Reconciler::new(Store::default(), DedupConfig::default());
        let outbox = Outbox::new(
            env.clone(),
            Arc::clone(&channel),
            Arc::clone(&rest),
            reconciler.clone(),
            ACK_TIMEOUT,
        );
        Self { env, channel, rest, reconciler, outbox }
    }

    /// Connected channel, REST answering with the persisted message.
    fn answering() -> Self {
        Self::new(MockChannel::connected(), MockRest::answering(json!({ "message": persisted() })))
    }

    /// Deliver the persisted message as a server push.
    fn push(&self) -> Option<Message> {
        self.reconciler.deliver(room(), &persisted(), DeliveryPath::Push, self.env.wall_clock_ms())
    }

    fn store(&self) -> &Store {
        self.reconciler.store()
    }

    fn room_len(&self) -> usize {
        self.store().snapshot().messages(&room()).len()
    }
}

fn room() -> ConversationKey {
    ConversationKey::room("r1")
}

fn persisted() -> Value {
    json!({ "id": "m1", "text": "hi", "ts": 1_000, "fromSessionId": "me" })
}

#[tokio::test(start_paused = true)]
async fn ack_in_time_confirms_without_rest() {
    let fx = Fixture::answering();

    let outbox = fx.outbox.clone();
    let send = tokio::spawn(async move { outbox.send(room(), "hi", MediaRefs::default()).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    // Optimistic echo while the ack is outstanding
    assert_eq!(fx.store().snapshot().outbox[0].state, SendState::SentRealtime);
    assert!(fx.channel.ack_next(Ack::ok_with_message(persisted())));

    let report = send.await.unwrap();
    assert_eq!(report.state, SendState::Confirmed);
    assert_eq!(
        report.transitions,
        vec![SendState::Created, SendState::SentRealtime, SendState::Acked, SendState::Confirmed]
    );
    assert_eq!(report.message.map(|m| m.id.to_string()), Some("m1".to_string()));
    assert_eq!(fx.rest.calls(), 0);
    assert_eq!(fx.room_len(), 1);
    assert!(fx.store().snapshot().outbox.is_empty());
    assert!(matches!(
        &fx.channel.emitted()[..],
        [OutboundAction::SendRoomMessage { room_id, .. }] if room_id == "r1"
    ));
}

#[tokio::test(start_paused = true)]
async fn timeout_falls_back_once_and_late_deliveries_are_absorbed() {
    let fx = Fixture::answering();

    let outbox = fx.outbox.clone();
    let send = tokio::spawn(async move { outbox.send(room(), "hi", MediaRefs::default()).await });

    tokio::time::sleep(Duration::from_millis(1_900)).await;
    let report = send.await.unwrap();
    assert_eq!(report.state, SendState::Confirmed);
    assert_eq!(
        report.transitions,
        vec![
            SendState::Created,
            SendState::SentRealtime,
            SendState::TimedOut,
            SendState::FallbackRest,
            SendState::Confirmed,
        ]
    );
    assert_eq!(fx.rest.calls(), 1);
    assert_eq!(fx.room_len(), 1);

    // Push of the same message at 2000 ms
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.push().is_none());

    // The straggling ack has nobody to talk to
    assert!(!fx.channel.ack_next(Ack::ok_with_message(persisted())));
    assert_eq!(fx.room_len(), 1);
    assert_eq!(fx.rest.calls(), 1);
}

/// Environment whose timers have always already expired.
#[derive(Clone, Default)]
struct ExpiredTimers(MockEnv);

impl Environment for ExpiredTimers {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        self.0.now()
    }

    fn wall_clock_ms(&self) -> i64 {
        self.0.wall_clock_ms()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.0.random_bytes(buffer);
    }
}

#[tokio::test]
async fn ack_timeout_is_driven_by_the_environment() {
    let channel = Arc::new(MockChannel::connected());
    let rest = Arc::new(MockRest::answering(json!({ "message": persisted() })));
    let reconciler = Reconciler::new(Store::default(), DedupConfig::default());
    let outbox = Outbox::new(
        ExpiredTimers::default(),
        Arc::clone(&channel),
        Arc::clone(&rest),
        reconciler.clone(),
        Duration::from_secs(3600),
    );

    // Tokio time is not paused; only the environment can end the wait
    let report = outbox.send(room(), "hi", MediaRefs::default()).await;

    assert_eq!(report.state, SendState::Confirmed);
    assert!(report.transitions.contains(&SendState::TimedOut));
    assert_eq!(rest.calls(), 1);
    assert!(!channel.ack_next(Ack::ok_with_message(persisted())));
    assert_eq!(reconciler.store().snapshot().messages(&room()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn push_before_ack_is_stored_once() {
    let fx = Fixture::new(MockChannel::connected(), MockRest::failing("unused"));

    let outbox = fx.outbox.clone();
    let send = tokio::spawn(async move { outbox.send(room(), "hi", MediaRefs::default()).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.push().is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.channel.ack_next(Ack::ok_with_message(persisted())));

    let report = send.await.unwrap();
    assert_eq!(report.state, SendState::Confirmed);
    // The push won; this send inserted nothing itself
    assert_eq!(report.message, None);
    assert_eq!(fx.room_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn negative_ack_falls_back_to_rest() {
    let fx = Fixture::new(MockChannel::connected(), MockRest::answering(persisted()));

    let outbox = fx.outbox.clone();
    let send = tokio::spawn(async move { outbox.send(room(), "hi", MediaRefs::default()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fx.channel.ack_next(Ack::rejected("rate limited")));

    let report = send.await.unwrap();
    assert_eq!(
        report.transitions,
        vec![
            SendState::Created,
            SendState::SentRealtime,
            SendState::FallbackRest,
            SendState::Confirmed,
        ]
    );
    assert_eq!(fx.rest.calls(), 1);
    // Bare REST body (no `message` wrapper) is accepted
    assert_eq!(fx.room_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_ack_falls_back_to_rest() {
    let fx = Fixture::answering();

    let outbox = fx.outbox.clone();
    let send = tokio::spawn(async move { outbox.send(room(), "hi", MediaRefs::default()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.channel.drop_acks();

    let report = send.await.unwrap();
    assert_eq!(report.state, SendState::Confirmed);
    assert_eq!(fx.rest.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn both_paths_failing_leaves_failed_entry_in_outbox() {
    let fx = Fixture::new(MockChannel::default(), MockRest::failing("503"));

    let report = fx.outbox.send(room(), "hi", MediaRefs::default()).await;

    assert_eq!(report.state, SendState::Failed);
    assert_eq!(
        report.transitions,
        vec![SendState::Created, SendState::FallbackRest, SendState::Failed]
    );
    let Some(SendError::Failed { realtime, rest }) = &report.error else {
        panic!("expected a failure on both paths, got {:?}", report.error);
    };
    assert!(matches!(**realtime, SendError::ChannelUnavailable(_)));
    assert!(matches!(**rest, SendError::Rest(_)));

    let snapshot = fx.store().snapshot();
    assert_eq!(snapshot.outbox.len(), 1);
    assert_eq!(snapshot.outbox[0].state, SendState::Failed);
    assert_eq!(snapshot.outbox[0].local_id, report.local_id);
    assert_eq!(fx.room_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_sends_get_distinct_local_ids() {
    let fx = Fixture::new(MockChannel::default(), MockRest::failing("down"));

    let (a, b) = tokio::join!(
        fx.outbox.send(room(), "one", MediaRefs::default()),
        fx.outbox.send(room(), "two", MediaRefs::default())
    );

    assert_ne!(a.local_id, b.local_id);
    assert_eq!(fx.store().snapshot().outbox.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn request_reports_ack_outcome() {
    let fx = Fixture::new(MockChannel::connected(), MockRest::failing("unused"));
    let join = OutboundAction::JoinRoom { room_id: "r1".into() };

    let outbox = fx.outbox.clone();
    let action = join.clone();
    let pending = tokio::spawn(async move { outbox.request(&action).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    fx.channel.ack_next(Ack::from_value(json!({ "ok": true, "roomId": "r1" })));
    let ack = pending.await.unwrap().unwrap();
    assert_eq!(ack.data["roomId"], "r1");

    let outbox = fx.outbox.clone();
    let action = join.clone();
    let pending = tokio::spawn(async move { outbox.request(&action).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    fx.channel.ack_next(Ack::rejected("forbidden"));
    assert_eq!(pending.await.unwrap(), Err(SendError::AckRejected("forbidden".into())));

    // Nobody answers
    let result = fx.outbox.request(&join).await;
    assert_eq!(result, Err(SendError::AckTimeout(ACK_TIMEOUT)));
    assert_eq!(fx.rest.calls(), 0);
}

#[tokio::test]
async fn request_without_channel_is_unavailable() {
    let fx = Fixture::new(MockChannel::default(), MockRest::failing("unused"));
    let result = fx.outbox.request(&OutboundAction::LeaveRoom { room_id: "r1".into() }).await;
    assert!(matches!(result, Err(SendError::ChannelUnavailable(_))));
}

#[tokio::test]
async fn history_fetch_merges_without_duplicates() {
    let page = vec![json!({ "id": "m1", "ts": 1 }), json!({ "id": "m2", "ts": 2 })];
    let fx = Fixture::new(MockChannel::default(), MockRest::failing("unused").with_history(page));

    assert_eq!(fx.outbox.fetch_history(&room(), 50).await.unwrap(), 2);
    assert_eq!(fx.outbox.fetch_history(&room(), 50).await.unwrap(), 0);
    assert_eq!(fx.room_len(), 2);
}
