//! Bounded, time-windowed "have I processed this before" oracle.
//!
//! Delivery is at-least-once: the same message can arrive as a push, inside an
//! ack, in a REST response, and again after a reconnect. Every path asks the
//! window before touching the store, so one logical occurrence is processed
//! once per TTL.
//!
//! # Eviction
//!
//! Before an insert that would exceed `max_entries`, expired entries are
//! purged. If the window is still full, the oldest half by recorded time is
//! dropped. `len() <= max_entries` holds after every call.

use std::{collections::HashMap, fmt, time::Duration};

use crate::message::{ConversationKey, MessageId};

/// Default trailing window.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(15);

/// Default maximum number of tracked keys.
pub const DEFAULT_DEDUP_MAX_ENTRIES: usize = 2000;

/// Event category namespace for dedup keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DedupCategory {
    /// Chat message in a room or thread
    Message,
    /// Any other keyed event (call ring, invite)
    Event,
}

/// Namespaced dedup key: category + conversation + item id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    category: DedupCategory,
    scope: String,
    item: String,
}

impl DedupKey {
    /// Key for a message in a conversation.
    pub fn message(conversation: &ConversationKey, id: &MessageId) -> Self {
        Self {
            category: DedupCategory::Message,
            scope: conversation.to_string(),
            item: id.as_str().to_string(),
        }
    }

    /// Key for a non-message event (e.g. `("call", call_id)`).
    pub fn event(scope: impl Into<String>, item: impl Into<String>) -> Self {
        Self { category: DedupCategory::Event, scope: scope.into(), item: item.into() }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            DedupCategory::Message => write!(f, "{}:{}", self.scope, self.item),
            DedupCategory::Event => write!(f, "event:{}:{}", self.scope, self.item),
        }
    }
}

/// Dedup window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    /// Entries younger than this reject redelivery
    pub ttl: Duration,
    /// Hard upper bound on tracked keys
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_DEDUP_TTL, max_entries: DEFAULT_DEDUP_MAX_ENTRIES }
    }
}

/// Map of `key -> last seen (wall clock ms)`.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    config: DedupConfig,
    seen: HashMap<DedupKey, i64>,
}

impl DedupWindow {
    /// Create an empty window. A zero `max_entries` is raised to one.
    pub fn new(config: DedupConfig) -> Self {
        let config = DedupConfig { max_entries: config.max_entries.max(1), ..config };
        Self { config, seen: HashMap::new() }
    }

    /// Should the event identified by `key` be processed?
    ///
    /// Returns false if `key` was recorded within the TTL. Otherwise records
    /// `now_ms` and returns true.
    pub fn admit(&mut self, key: DedupKey, now_ms: i64) -> bool {
        if let Some(&seen_at) = self.seen.get(&key)
            && !self.expired(seen_at, now_ms)
        {
            tracing::debug!(key = %key, "dedup rejected redelivery");
            return false;
        }

        if !self.seen.contains_key(&key) && self.seen.len() >= self.config.max_entries {
            self.evict(now_ms);
        }

        self.seen.insert(key, now_ms);
        true
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Active configuration.
    pub fn config(&self) -> DedupConfig {
        self.config
    }

    fn expired(&self, seen_at: i64, now_ms: i64) -> bool {
        now_ms.saturating_sub(seen_at) > self.ttl_ms()
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Purge expired entries, then the oldest half if still at capacity.
    fn evict(&mut self, now_ms: i64) {
        let before = self.seen.len();
        let ttl_ms = self.ttl_ms();
        self.seen.retain(|_, seen_at| now_ms.saturating_sub(*seen_at) <= ttl_ms);

        if self.seen.len() >= self.config.max_entries {
            let mut by_age: Vec<(i64, DedupKey)> =
                self.seen.iter().map(|(key, &seen_at)| (seen_at, key.clone())).collect();
            by_age.sort_unstable();

            // Half of the bound, at least one, so the insert that follows fits
            let drop_count = (self.seen.len() - self.config.max_entries / 2).max(1);
            for (_, key) in by_age.into_iter().take(drop_count) {
                self.seen.remove(&key);
            }
        }

        tracing::debug!(before, after = self.seen.len(), "dedup window evicted");
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
