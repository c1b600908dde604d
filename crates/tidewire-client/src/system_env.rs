//! Production Environment implementation using system time and RNG.
//!
//! # Capabilities
//!
//! - Real monotonic time (`std::time::Instant`) for connection timers
//! - Real wall clock for message timestamps and dedup bookkeeping
//! - OS randomness (getrandom) for reconnect jitter and local send ids
//! - Tokio async sleep

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tidewire_core::Environment;

/// Production environment using system time and OS randomness.
///
/// Randomness here only spreads reconnect attempts and tags local sends, so an
/// RNG failure degrades to zeroed bytes (no jitter) with a warning instead of
/// taking the client down.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn wall_clock_ms(&self) -> i64 {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        i64::try_from(since_epoch.as_millis()).unwrap_or(i64::MAX)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        if let Err(err) = getrandom::fill(buffer) {
            tracing::warn!(%err, "os rng unavailable, using zeroed bytes");
            buffer.fill(0);
        }
    }
}
