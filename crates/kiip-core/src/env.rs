//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness, timers).
//! Enables deterministic simulation with a virtual clock and seeded RNG, and
//! production use on a tokio `LocalSet`.

use std::{fmt, ops::Sub, time::Duration};

/// Handle to a pending timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Abstract environment providing time, randomness, and one-shot timers.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - A timer callback never runs synchronously inside `set_timer`
/// - A timer callback never runs after `cancel_timer` returned for its id
/// - Callbacks run one at a time on the caller's thread
pub trait Environment: Clone + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, while simulation
    /// environments use virtual time.
    type Instant: Copy + Ord + fmt::Debug + Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Fills the provided buffer with random bytes.
    ///
    /// Given the same seed, a simulation environment produces the same bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Runs `callback` once after `delay`.
    fn set_timer(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId;

    /// Cancels a pending timer. Unknown or already fired ids are ignored.
    fn cancel_timer(&self, id: TimerId);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates `len` random lowercase hex digits.
    ///
    /// Used for instance identities and request correlation ids.
    fn random_hex(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len.div_ceil(2)];
        self.random_bytes(&mut bytes);
        let mut hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        hex.truncate(len);
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct FixedEnv;

    impl Environment for FixedEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::ZERO
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = 0xa0 + i as u8;
            }
        }

        fn set_timer(&self, _delay: Duration, _callback: Box<dyn FnOnce()>) -> TimerId {
            TimerId(0)
        }

        fn cancel_timer(&self, _id: TimerId) {}
    }

    #[test]
    fn random_hex_has_requested_length() {
        let env = FixedEnv;
        assert_eq!(env.random_hex(5), "a0a1a");
        assert_eq!(env.random_hex(4), "a0a1");
        assert_eq!(env.random_hex(0), "");
    }

    #[test]
    fn random_u64_is_big_endian() {
        assert_eq!(FixedEnv.random_u64(), 0xa0a1_a2a3_a4a5_a6a7);
    }
}
