//! Connection manager state machine.
//!
//! Owns the one realtime channel handle, the handshake credential, the
//! reconnection policy, and the liveness watchdog. Uses the action pattern:
//! methods take time as input and return actions for the driver to execute.
//! The manager never touches a socket itself.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ connect ┌────────────┐  Opened   ┌───────────┐
//! │ Idle │────────>│ Connecting │──────────>│ Connected │
//! └──────┘         └────────────┘           └───────────┘
//!    ↑                  │    ↑                    │
//!    │ reset            │    │ retry_at /         │ Closed / Error /
//!    │                  │    │ visible /          │ watchdog
//!    │     Closed /     ↓    │ watchdog           ↓
//!    │     timeout  ┌──────────────┐<─────────────┘
//!    └──────────────│ Reconnecting │
//!                   └──────────────┘
//! ```
//!
//! # Handle lifecycle
//!
//! A [`ChannelHandle`] is created by the first [`ConnectionManager::connect`]
//! and survives every reconnect. Only [`ConnectionManager::reset`] tears it
//! down. Each physical open gets a fresh [`OpenId`]; transport events tagged
//! with an older id are ignored, so a late `Closed` from a replaced socket
//! cannot knock over its successor.

use std::time::Duration;

use crate::{
    env::Environment,
    error::ConnectionError,
    snapshot::{ChannelStatus, NotificationDraft, NotificationKind},
};

/// Watchdog evaluation period.
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_millis(1200);

/// Minimum time between two connection attempts started by the watchdog.
pub const DEFAULT_MIN_RECONNECT_GAP: Duration = Duration::from_millis(800);

/// Time allowed for an open to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// First reconnection delay.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(600);

/// Upper bound on any reconnection delay.
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_millis(4000);

/// Fraction of the delay added as random jitter.
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.2;

/// Identity of the process-wide channel. Stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(u64);

impl ChannelHandle {
    /// Numeric id, for logging.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// One physical open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpenId(u64);

impl OpenId {
    /// Numeric id, for logging.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// What the transport reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed
    Opened,
    /// Channel closed by the peer or the network
    Closed {
        /// Close reason
        reason: String,
    },
    /// Open failed or the channel errored
    Error(ConnectionError),
}

/// Actions returned by the connection manager.
///
/// The driver executes these:
/// - `BindHandlers`: register inbound event handlers on the channel
/// - `Open`: drop any current socket and open a new one
/// - `Close`: drop the current socket
/// - `Notify`: push a passive notification into the store
/// - `Status`: publish the channel status into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Register inbound handlers. Emitted once per handle.
    BindHandlers {
        /// Handle to bind on
        handle: ChannelHandle,
    },
    /// Open the channel
    Open {
        /// Process-wide handle
        handle: ChannelHandle,
        /// Tag for transport events produced by this open
        open_id: OpenId,
        /// Target endpoint
        endpoint: String,
        /// Handshake credential
        credential: Option<String>,
    },
    /// Close the channel
    Close {
        /// Process-wide handle
        handle: ChannelHandle,
        /// Close reason
        reason: String,
    },
    /// Passive `SYSTEM` notification
    Notify(NotificationDraft),
    /// Channel status changed
    Status(ChannelStatus),
}

/// Exponential backoff with jitter, bounded by `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any delay, jitter included
    pub max: Duration,
    /// Jitter as a fraction of the exponential delay
    pub jitter_ratio: f64,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// `min(base * 2^(attempt-1) * (1 + jitter_ratio * jitter_unit), max)`,
    /// with `jitter_unit` in `[0, 1)`.
    pub fn delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exp_ms = (base_ms * f64::from(1u32 << exponent)).min(max_ms);
        let jitter = self.jitter_ratio.max(0.0) * jitter_unit.clamp(0.0, 1.0);
        Duration::from_millis((exp_ms * (1.0 + jitter)).min(max_ms) as u64)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BASE,
            max: DEFAULT_RECONNECT_MAX,
            jitter_ratio: DEFAULT_RECONNECT_JITTER,
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Realtime endpoint
    pub endpoint: String,
    /// Watchdog evaluation period
    pub watchdog_period: Duration,
    /// Minimum gap between watchdog-initiated attempts
    pub min_reconnect_gap: Duration,
    /// Time allowed for an open to complete
    pub connect_timeout: Duration,
    /// Backoff after failures
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            watchdog_period: DEFAULT_WATCHDOG_PERIOD,
            min_reconnect_gap: DEFAULT_MIN_RECONNECT_GAP,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState<I> {
    /// No handle
    Idle,
    /// Open in flight
    Connecting {
        /// When the open was issued
        since: I,
    },
    /// Channel open
    Connected,
    /// Waiting out a backoff delay
    Reconnecting {
        /// Consecutive failures so far
        attempt: u32,
        /// When the next open is due
        retry_at: I,
    },
}

/// Owner of the single realtime channel.
///
/// Time is passed into every method; the environment only supplies jitter
/// and wall-clock stamps for notifications.
#[derive(Debug)]
pub struct ConnectionManager<E: Environment> {
    env: E,
    config: ConnectionConfig,
    credential: Option<String>,
    /// Inbound handlers registered on the current handle
    bound: bool,
    handle: Option<ChannelHandle>,
    next_handle: u64,
    open_id: OpenId,
    state: ConnectionState<E::Instant>,
    visible: bool,
    failures: u32,
    last_attempt: Option<E::Instant>,
    last_watchdog: Option<E::Instant>,
}

impl<E: Environment> ConnectionManager<E> {
    /// Create a manager with no handle. Starts visible.
    pub fn new(env: E, config: ConnectionConfig, credential: Option<String>) -> Self {
        Self {
            env,
            config,
            credential,
            bound: false,
            handle: None,
            next_handle: 1,
            open_id: OpenId(0),
            state: ConnectionState::Idle,
            visible: true,
            failures: 0,
            last_attempt: None,
            last_watchdog: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState<E::Instant> {
        self.state
    }

    /// Status as published to the store.
    pub fn status(&self) -> ChannelStatus {
        match self.state {
            ConnectionState::Idle => ChannelStatus::Idle,
            ConnectionState::Connecting { .. } => ChannelStatus::Connecting,
            ConnectionState::Connected => ChannelStatus::Connected,
            ConnectionState::Reconnecting { .. } => ChannelStatus::Reconnecting,
        }
    }

    /// Process-wide handle, if one exists.
    pub fn handle(&self) -> Option<ChannelHandle> {
        self.handle
    }

    /// Whether inbound handlers are registered on the current handle.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Tag of the most recent open.
    pub fn current_open(&self) -> OpenId {
        self.open_id
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Current credential.
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Configuration in use.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Return the existing handle, or create one and open it.
    ///
    /// Idempotent: while a handle exists (live, connecting, or waiting to
    /// reconnect) this returns it with no actions.
    pub fn connect(&mut self, now: E::Instant) -> (ChannelHandle, Vec<ConnectionAction>) {
        if let Some(handle) = self.handle {
            return (handle, Vec::new());
        }

        let handle = ChannelHandle(self.next_handle);
        self.next_handle += 1;
        self.handle = Some(handle);
        tracing::info!(
            handle = handle.id(),
            endpoint = %self.config.endpoint,
            "channel handle created"
        );

        let mut actions = Vec::new();
        if !self.bound {
            self.bound = true;
            actions.push(ConnectionAction::BindHandlers { handle });
        }
        actions.extend(self.open(handle, now));
        (handle, actions)
    }

    /// Replace the handshake credential.
    ///
    /// With a live handle this forces a close and a fresh open, so a stale
    /// credential never persists on the channel.
    pub fn set_credential(
        &mut self,
        credential: Option<String>,
        now: E::Instant,
    ) -> Vec<ConnectionAction> {
        if self.credential == credential {
            return Vec::new();
        }
        self.credential = credential;

        let Some(handle) = self.handle else {
            return Vec::new();
        };

        tracing::info!(handle = handle.id(), "credential rotated, reconnecting");
        self.failures = 0;
        let close = ConnectionAction::Close { handle, reason: "credential rotated".to_string() };
        let mut actions = vec![close];
        actions.extend(self.open(handle, now));
        actions
    }

    /// Tear down the handle entirely (e.g. on logout).
    pub fn reset(&mut self) -> Vec<ConnectionAction> {
        let Some(handle) = self.handle.take() else {
            return Vec::new();
        };

        tracing::info!(handle = handle.id(), "channel reset");
        self.bound = false;
        self.state = ConnectionState::Idle;
        self.failures = 0;
        self.last_attempt = None;
        self.last_watchdog = None;
        vec![
            ConnectionAction::Close { handle, reason: "reset".to_string() },
            ConnectionAction::Status(ChannelStatus::Idle),
        ]
    }

    /// Document visibility changed.
    ///
    /// Retries pause while hidden. Coming to the foreground with a handle
    /// that is not connected opens immediately.
    pub fn set_visibility(&mut self, visible: bool, now: E::Instant) -> Vec<ConnectionAction> {
        let was_visible = self.visible;
        self.visible = visible;

        if !visible || was_visible {
            return Vec::new();
        }
        let Some(handle) = self.handle else {
            return Vec::new();
        };

        match self.state {
            ConnectionState::Reconnecting { .. } => {
                tracing::debug!(handle = handle.id(), "foregrounded, reconnecting now");
                self.open(handle, now)
            },
            ConnectionState::Idle
            | ConnectionState::Connecting { .. }
            | ConnectionState::Connected => Vec::new(),
        }
    }

    /// Whether the document is visible.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Feed a transport event produced by open `open_id`.
    ///
    /// Never fails: errors become a `SYSTEM` notification and a scheduled
    /// retry.
    pub fn handle_transport(
        &mut self,
        open_id: OpenId,
        event: TransportEvent,
        now: E::Instant,
    ) -> Vec<ConnectionAction> {
        let Some(handle) = self.handle else {
            return Vec::new();
        };
        if open_id != self.open_id {
            tracing::debug!(
                stale = open_id.get(),
                current = self.open_id.get(),
                "stale transport event ignored"
            );
            return Vec::new();
        }

        match event {
            TransportEvent::Opened => {
                tracing::info!(handle = handle.id(), open = open_id.get(), "channel connected");
                self.state = ConnectionState::Connected;
                self.failures = 0;
                vec![ConnectionAction::Status(ChannelStatus::Connected)]
            },
            TransportEvent::Closed { reason } => {
                if matches!(self.state, ConnectionState::Reconnecting { .. }) {
                    return Vec::new();
                }
                tracing::warn!(handle = handle.id(), %reason, "channel closed");
                let mut actions = vec![self.system_notice("Disconnected", &reason)];
                actions.extend(self.schedule_retry(now));
                actions
            },
            TransportEvent::Error(error) => {
                tracing::warn!(
                    handle = handle.id(),
                    %error,
                    transient = error.is_transient(),
                    "channel error"
                );
                let mut actions = vec![self.system_notice("Connection error", &error.to_string())];
                if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
                    actions.extend(self.schedule_retry(now));
                }
                actions
            },
        }
    }

    /// Drive timers: backoff retries, connect timeout, and the watchdog.
    ///
    /// `transport_connected` is what the driver's socket reports right now;
    /// the watchdog trusts it over our own state, because some failures never
    /// produce a close event.
    pub fn tick(&mut self, now: E::Instant, transport_connected: bool) -> Vec<ConnectionAction> {
        let Some(handle) = self.handle else {
            return Vec::new();
        };

        match self.state {
            ConnectionState::Reconnecting { retry_at, .. } if self.visible && now >= retry_at => {
                return self.open(handle, now);
            },
            ConnectionState::Connecting { since } if now - since >= self.config.connect_timeout => {
                let error = ConnectionError::ConnectTimeout { elapsed: now - since };
                tracing::warn!(handle = handle.id(), %error, "open timed out");
                let mut actions = vec![
                    ConnectionAction::Close { handle, reason: "connect timeout".to_string() },
                    self.system_notice("Connection error", &error.to_string()),
                ];
                actions.extend(self.schedule_retry(now));
                return actions;
            },
            _ => {},
        }

        self.watchdog(handle, now, transport_connected)
    }

    fn watchdog(
        &mut self,
        handle: ChannelHandle,
        now: E::Instant,
        transport_connected: bool,
    ) -> Vec<ConnectionAction> {
        if !self.visible {
            return Vec::new();
        }
        if self.last_watchdog.is_some_and(|last| now - last < self.config.watchdog_period) {
            return Vec::new();
        }
        self.last_watchdog = Some(now);

        if transport_connected || matches!(self.state, ConnectionState::Connecting { .. }) {
            return Vec::new();
        }
        if self.last_attempt.is_some_and(|last| now - last < self.config.min_reconnect_gap) {
            return Vec::new();
        }

        tracing::info!(handle = handle.id(), state = ?self.status(), "watchdog forcing reconnect");
        let mut actions = Vec::new();
        if self.state == ConnectionState::Connected {
            actions.push(ConnectionAction::Close { handle, reason: "watchdog".to_string() });
        }
        actions.extend(self.open(handle, now));
        actions
    }

    fn open(&mut self, handle: ChannelHandle, now: E::Instant) -> Vec<ConnectionAction> {
        self.open_id = OpenId(self.open_id.0 + 1);
        self.state = ConnectionState::Connecting { since: now };
        self.last_attempt = Some(now);
        tracing::debug!(handle = handle.id(), open = self.open_id.get(), "opening channel");

        vec![
            ConnectionAction::Status(ChannelStatus::Connecting),
            ConnectionAction::Open {
                handle,
                open_id: self.open_id,
                endpoint: self.config.endpoint.clone(),
                credential: self.credential.clone(),
            },
        ]
    }

    fn schedule_retry(&mut self, now: E::Instant) -> Vec<ConnectionAction> {
        self.failures = self.failures.saturating_add(1);
        let delay = self.config.reconnect.delay(self.failures, self.env.random_unit());
        let retry_at = now + delay;
        self.state = ConnectionState::Reconnecting { attempt: self.failures, retry_at };
        tracing::debug!(
            attempt = self.failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        vec![ConnectionAction::Status(ChannelStatus::Reconnecting)]
    }

    fn system_notice(&self, title: &str, body: &str) -> ConnectionAction {
        let now_ms = self.env.wall_clock_ms();
        ConnectionAction::Notify(
            NotificationDraft::new(NotificationKind::System, title, now_ms).with_body(body),
        )
    }
}
