//! Production Environment implementation using system time and RNG.
//!
//! Timers are tokio tasks spawned on the current `LocalSet`, so callbacks run
//! on the thread that armed them, one at a time. Every `SystemEnv` method that
//! arms a timer must therefore be called from inside a `LocalSet`.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
    time::Duration,
};

use kiip_core::{Environment, TimerId};
use tokio::task::AbortHandle;

#[derive(Default)]
struct Timers {
    pending: RefCell<HashMap<u64, AbortHandle>>,
    next_id: Cell<u64>,
}

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Request ids and instance identities cannot be
/// generated without it, and the failure indicates an OS-level problem.
#[derive(Clone, Default)]
pub struct SystemEnv {
    timers: Rc<Timers>,
}

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers armed and not yet fired or cancelled.
    pub fn pending_timers(&self) -> usize {
        self.timers.pending.borrow().len()
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }

    fn set_timer(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = self.timers.next_id.get();
        self.timers.next_id.set(id + 1);

        let timers = Rc::clone(&self.timers);
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            timers.pending.borrow_mut().remove(&id);
            callback();
        });
        self.timers.pending.borrow_mut().insert(id, task.abort_handle());
        TimerId(id)
    }

    fn cancel_timer(&self, id: TimerId) {
        let handle = self.timers.pending.borrow_mut().remove(&id.0);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl fmt::Debug for SystemEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemEnv").field("pending_timers", &self.pending_timers()).finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::LocalSet;

    use super::*;

    #[test]
    fn random_bytes_are_random() {
        let env = SystemEnv::new();

        let mut bytes1 = [0u8; 32];
        let mut bytes2 = [0u8; 32];
        env.random_bytes(&mut bytes1);
        env.random_bytes(&mut bytes2);

        assert_ne!(bytes1, bytes2, "Random bytes should differ");
    }

    #[test]
    fn random_hex_has_requested_length() {
        let env = SystemEnv::new();
        let id = env.random_hex(5);
        assert_eq!(id.len(), 5);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn timer_fires_after_delay() {
        LocalSet::new()
            .run_until(async {
                let env = SystemEnv::new();
                let fired = Rc::new(Cell::new(false));
                let f = Rc::clone(&fired);

                let start = env.now();
                env.set_timer(Duration::from_millis(20), Box::new(move || f.set(true)));
                assert!(!fired.get());
                assert_eq!(env.pending_timers(), 1);

                tokio::time::sleep(Duration::from_millis(60)).await;
                assert!(fired.get());
                assert!(env.now() - start >= Duration::from_millis(20));
                assert_eq!(env.pending_timers(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        LocalSet::new()
            .run_until(async {
                let env = SystemEnv::new();
                let fired = Rc::new(Cell::new(false));
                let f = Rc::clone(&fired);

                let id = env.set_timer(Duration::from_millis(10), Box::new(move || f.set(true)));
                env.cancel_timer(id);
                env.cancel_timer(id);

                tokio::time::sleep(Duration::from_millis(40)).await;
                assert!(!fired.get());
                assert_eq!(env.pending_timers(), 0);
            })
            .await;
    }
}
