//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples client logic from system resources
//! (time and randomness). Production uses the system clock and OS entropy;
//! the simulation harness uses a virtual clock and a seeded RNG so every run
//! with the same seed sends the same message IDs, tokens and retransmission
//! jitter.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Determinism: Given the same seed, `random_bytes()` produces the same
//!   sequence

use std::time::Instant;

/// Source of time and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Returns the current time.
    ///
    /// Subsequent calls must return times >= previous calls.
    fn now(&self) -> Instant;

    /// Fills the provided buffer with random bytes.
    ///
    /// Tokens are drawn from here, so production implementations must use OS
    /// entropy rather than a userspace PRNG.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u16`, used to seed message ID counters.
    fn random_u16(&self) -> u16 {
        let mut bytes = [0u8; 2];
        self.random_bytes(&mut bytes);
        u16::from_be_bytes(bytes)
    }

    /// Uniform fraction in `[0, 1)`.
    fn random_fraction(&self) -> f64 {
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
