//! Tidewire core
//!
//! Pure, I/O-free building blocks of the realtime chat client: everything with
//! real invariants lives here, and nothing here opens a socket or reads a
//! clock on its own.
//!
//! # Architecture
//!
//! Inbound events flow through one pipeline:
//!
//! ```text
//! channel event ─> protocol::InboundEvent ─> Reconciler ─┬─> Store ─> subscribers
//!                                           (normalize,   │
//!                                            dedup)       └─> AlertPolicy
//! ```
//!
//! Outbound sends reconcile through the same [`Reconciler`], so every delivery
//! path (push, ack body, REST response) shares one identity check.
//!
//! # Components
//!
//! - [`message`]: canonical record and normalizer
//! - [`DedupWindow`]: bounded, time-windowed redelivery filter
//! - [`Store`]: single source of truth with publish/subscribe
//! - [`Reconciler`]: normalize, dedup, insert
//! - [`AlertPolicy`]: interrupt or stay quiet
//! - [`ConnectionManager`]: channel handle, backoff, watchdog
//! - [`send`]: per-attempt send state machine
//! - [`Environment`]: time and randomness abstraction

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod alert;
pub mod connection;
pub mod dedup;
pub mod env;
pub mod error;
pub mod message;
pub mod protocol;
pub mod reconcile;
pub mod send;
pub mod snapshot;
pub mod store;

pub use alert::{Alert, AlertDecision, AlertPolicy};
pub use connection::{
    ChannelHandle, ConnectionAction, ConnectionConfig, ConnectionManager, ConnectionState, OpenId,
    ReconnectPolicy, TransportEvent,
};
pub use dedup::{DedupConfig, DedupKey, DedupWindow};
pub use env::Environment;
pub use error::{ConnectionError, PayloadError, SendError};
pub use message::{ConversationKey, MediaRefs, Message, MessageId};
pub use protocol::{Ack, InboundEvent, OutboundAction};
pub use reconcile::{DeliveryPath, Reconciler};
pub use send::{PendingSend, SendAttempt, SendState};
pub use snapshot::{
    CallInfo, ChannelStatus, Notification, NotificationDraft, NotificationKind, RoomSummary,
    Snapshot, SnapshotPatch,
};
pub use store::{Store, Subscription};
