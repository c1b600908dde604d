//! Client
//!
//! Composition root of the tidewire chat client: wires the pure components of
//! [`tidewire_core`] into one event-driven client and drives it over real I/O.
//!
//! # Architecture
//!
//! [`Client`] follows the same Sans-IO and action-based patterns as
//! [`tidewire_core`]. It receives events ([`ClientEvent`]), updates the
//! [`Store`] through pure component logic, and returns actions
//! ([`ClientAction`]) for the caller to execute. The [`Runtime`] is that
//! caller in production: it owns a [`Channel`] and a [`RestApi`], runs the
//! tick and event loop, and spawns sends through the [`Outbox`].
//!
//! # Components
//!
//! - [`Client`]: Connection, inbound routing, notifications, alerts, typing
//! - [`Outbox`]: Ack-or-REST send coordinator
//! - [`Runtime`] / [`RuntimeHandle`]: Async event loop and its UI front end
//! - [`ClientConfig`]: Tunables, loadable from JSON
//! - [`SystemEnv`]: Production [`Environment`]
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, this crate also provides:
//! - [`transport::WsChannel`]: Websocket channel
//! - [`http::HttpApi`]: REST fallback and history over HTTP

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod channel;
mod client;
mod config;
mod event;
mod outbox;
mod runtime;
mod system_env;
mod typing;

#[cfg(feature = "transport")]
pub mod http;
#[cfg(feature = "transport")]
pub mod transport;

pub use channel::{Channel, ChannelEvent, OpenRequest, RestApi};
pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use event::{ClientAction, ClientEvent};
pub use outbox::{Outbox, SendReport};
pub use runtime::{Command, Runtime, RuntimeHandle, RuntimeStopped};
pub use system_env::SystemEnv;
pub use tidewire_core::{ConversationKey, Environment, MediaRefs, Store};
pub use typing::TypingDebounce;
