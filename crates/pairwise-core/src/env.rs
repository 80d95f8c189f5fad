//! Environment abstraction for deterministic testing.
//!
//! Decouples session logic from system resources (time, randomness). Every
//! key, nonce and registration id is drawn from [`Environment::random_bytes`],
//! so a seeded environment replays a whole session byte for byte.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only used between retries of directory calls.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Seconds since the Unix epoch, for record timestamps.
    fn wall_clock_secs(&self) -> u64;

    /// 32 random bytes, the size of every key seed.
    fn random_key_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        self.random_bytes(&mut seed);
        seed
    }

    /// Generates a random `u32`.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }
}

/// Deterministic environment for tests and simulation.
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::Duration,
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Fixed wall clock origin so record timestamps are reproducible.
    const WALL_CLOCK_ORIGIN_SECS: u64 = 1_700_000_000;

    /// Seeded RNG plus a virtual clock.
    ///
    /// `sleep` advances the virtual clock and returns immediately, so retry
    /// backoff costs no real time. Clones share RNG and clock.
    #[derive(Clone)]
    pub struct MockEnv {
        rng: Arc<Mutex<ChaCha20Rng>>,
        elapsed: Arc<Mutex<Duration>>,
    }

    impl MockEnv {
        /// Environment seeded with zero.
        pub fn new() -> Self {
            Self::with_seed(0)
        }

        /// Environment with an explicit seed.
        pub fn with_seed(seed: u64) -> Self {
            Self {
                rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
                elapsed: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        /// Advance the virtual clock.
        pub fn advance(&self, duration: Duration) {
            *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner) += duration;
        }

        /// Total virtual time elapsed.
        pub fn elapsed(&self) -> Duration {
            *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        type Instant = Duration;

        fn now(&self) -> Self::Instant {
            self.elapsed()
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            self.advance(duration);
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
        }

        fn wall_clock_secs(&self) -> u64 {
            WALL_CLOCK_ORIGIN_SECS + self.elapsed().as_secs()
        }
    }

}
