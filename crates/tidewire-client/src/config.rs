//! Client configuration.
//!
//! Every tunable lives in [`ClientConfig`], deserialized from JSON with
//! per-field defaults so a partial file only overrides what it names. All
//! durations are in milliseconds.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidewire_core::{
    ConnectionConfig, DedupConfig, ReconnectPolicy,
    connection::{
        DEFAULT_CONNECT_TIMEOUT, DEFAULT_MIN_RECONNECT_GAP, DEFAULT_RECONNECT_BASE,
        DEFAULT_RECONNECT_JITTER, DEFAULT_RECONNECT_MAX, DEFAULT_WATCHDOG_PERIOD,
    },
    dedup::{DEFAULT_DEDUP_MAX_ENTRIES, DEFAULT_DEDUP_TTL},
    snapshot::DEFAULT_NOTIFICATION_CAP,
};

/// Ack wait before falling back to REST.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1800);

/// Quiet period after the last keystroke before `typing:stop`.
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(900);

/// Runtime timer resolution.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Messages requested per history page.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Configuration file problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for [`ClientConfig`]
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Realtime endpoint (`http(s)://` or `ws(s)://`)
    pub socket_url: String,
    /// REST base URL
    pub api_base_url: String,
    /// Ack wait before the REST fallback
    pub ack_timeout_ms: u64,
    /// Dedup trailing window
    pub dedup_ttl_ms: u64,
    /// Dedup size bound
    pub dedup_max_entries: usize,
    /// Notification ring capacity
    pub notification_cap: usize,
    /// Watchdog period
    pub watchdog_period_ms: u64,
    /// Minimum gap between watchdog attempts
    pub min_reconnect_gap_ms: u64,
    /// First backoff delay
    pub reconnect_base_ms: u64,
    /// Backoff bound
    pub reconnect_max_ms: u64,
    /// Backoff jitter fraction
    pub reconnect_jitter: f64,
    /// Open timeout
    pub connect_timeout_ms: u64,
    /// Typing quiet period
    pub typing_idle_ms: u64,
    /// History page size
    pub history_limit: usize,
    /// Runtime timer resolution
    pub tick_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: "http://localhost:8080".to_string(),
            api_base_url: "http://localhost:8080".to_string(),
            ack_timeout_ms: millis(DEFAULT_ACK_TIMEOUT),
            dedup_ttl_ms: millis(DEFAULT_DEDUP_TTL),
            dedup_max_entries: DEFAULT_DEDUP_MAX_ENTRIES,
            notification_cap: DEFAULT_NOTIFICATION_CAP,
            watchdog_period_ms: millis(DEFAULT_WATCHDOG_PERIOD),
            min_reconnect_gap_ms: millis(DEFAULT_MIN_RECONNECT_GAP),
            reconnect_base_ms: millis(DEFAULT_RECONNECT_BASE),
            reconnect_max_ms: millis(DEFAULT_RECONNECT_MAX),
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            connect_timeout_ms: millis(DEFAULT_CONNECT_TIMEOUT),
            typing_idle_ms: millis(DEFAULT_TYPING_IDLE),
            history_limit: DEFAULT_HISTORY_LIMIT,
            tick_interval_ms: millis(DEFAULT_TICK_INTERVAL),
        }
    }
}

impl ClientConfig {
    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Read a JSON config file, falling back to defaults if it is missing or
    /// invalid. Never fails.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::from_file(path) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "config loaded");
                config
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "using default config");
                Self::default()
            },
        }
    }

    /// Connection manager settings.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            endpoint: self.socket_url.clone(),
            watchdog_period: Duration::from_millis(self.watchdog_period_ms),
            min_reconnect_gap: Duration::from_millis(self.min_reconnect_gap_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(self.reconnect_base_ms),
                max: Duration::from_millis(self.reconnect_max_ms),
                jitter_ratio: self.reconnect_jitter,
            },
        }
    }

    /// Dedup window settings.
    pub fn dedup(&self) -> DedupConfig {
        DedupConfig {
            ttl: Duration::from_millis(self.dedup_ttl_ms),
            max_entries: self.dedup_max_entries,
        }
    }

    /// Ack wait.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Typing quiet period.
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    /// Runtime timer resolution, at least one millisecond.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
