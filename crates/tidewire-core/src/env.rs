//! Environment abstraction for deterministic testing.
//!
//! Decouples the state machines from system resources (monotonic time, wall
//! clock, randomness). Tests drive a fixed clock and fixed jitter; production
//! uses the real system.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, tests may use a
    /// virtual clock.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + std::fmt::Debug
        + std::ops::Sub<Output = Duration>
        + std::ops::Add<Duration, Output = Self::Instant>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Milliseconds since the Unix epoch.
    ///
    /// Used for message timestamps and dedup bookkeeping, both of which are
    /// compared against server-issued wall-clock values.
    fn wall_clock_ms(&self) -> i64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this (the send coordinator's ack timeout); the
    /// state machines never do.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Uniform sample in `[0, 1)`, used to jitter reconnection delays.
    fn random_unit(&self) -> f64 {
        // 53 bits fit exactly in an f64 mantissa
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Deterministic environment for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use super::Environment;

    /// Virtual clock plus fixed "randomness".
    ///
    /// Clones share the clock, so a test can hold one copy and advance time
    /// seen by the component holding another.
    #[derive(Clone, Debug)]
    pub struct MockEnv {
        base: Instant,
        offset: Arc<Mutex<Duration>>,
        wall_base_ms: i64,
        fill: u8,
    }

    impl MockEnv {
        /// Clock at zero, wall clock at 1_700_000_000_000 ms, no jitter.
        pub fn new() -> Self {
            Self::with_fill(0)
        }

        /// Like [`MockEnv::new`], filling random buffers with `fill`.
        /// `0xff` yields a jitter unit just below one.
        pub fn with_fill(fill: u8) -> Self {
            Self {
                base: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
                wall_base_ms: 1_700_000_000_000,
                fill,
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
        }

        fn elapsed(&self) -> Duration {
            *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.base + self.elapsed()
        }

        fn wall_clock_ms(&self) -> i64 {
            self.wall_base_ms + i64::try_from(self.elapsed().as_millis()).unwrap_or(i64::MAX)
        }

        /// Waits on tokio's clock, which tests pause with `start_paused`. The
        /// virtual clock only moves through [`MockEnv::advance`].
        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            tokio::time::sleep(duration)
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(self.fill);
        }
    }
}
