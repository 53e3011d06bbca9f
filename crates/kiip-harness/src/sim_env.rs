//! Virtual-time environment.
//!
//! Time only moves when the test advances it. Timers fire in deadline order
//! (ties in creation order) and the RNG is seeded, so a run is fully
//! reproducible from its seed.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    fmt,
    rc::Rc,
    time::Duration,
};

use kiip_core::{Environment, TimerId};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

type Callback = Box<dyn FnOnce()>;

struct Inner {
    now: Cell<Duration>,
    rng: RefCell<ChaCha8Rng>,
    timers: RefCell<BTreeMap<(Duration, u64), Callback>>,
    deadlines: RefCell<HashMap<u64, Duration>>,
    next_timer: Cell<u64>,
    fired: Cell<u64>,
}

/// Deterministic single-threaded environment.
///
/// Clones share the same clock, RNG and timer queue.
#[derive(Clone)]
pub struct SimEnv {
    inner: Rc<Inner>,
}

impl SimEnv {
    /// Environment at time zero with RNG seeded from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Rc::new(Inner {
                now: Cell::new(Duration::ZERO),
                rng: RefCell::new(ChaCha8Rng::seed_from_u64(seed)),
                timers: RefCell::new(BTreeMap::new()),
                deadlines: RefCell::new(HashMap::new()),
                next_timer: Cell::new(0),
                fired: Cell::new(0),
            }),
        }
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        self.inner.now.get()
    }

    /// Number of pending timers.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Number of timers fired so far.
    pub fn fired_timers(&self) -> u64 {
        self.inner.fired.get()
    }

    /// Move the clock forward by `duration`, firing every timer that falls
    /// due on the way, including timers armed by those callbacks.
    pub fn advance(&self, duration: Duration) {
        let target = self.inner.now.get() + duration;
        while self.fire_next(target) {}
        self.inner.now.set(target);
    }

    /// Fire timers that are due now, without moving the clock.
    pub fn settle(&self) {
        self.advance(Duration::ZERO);
    }

    /// Fire timers until none is left or `max_timers` have fired.
    ///
    /// Returns whether the queue drained. A transport that keeps
    /// reconnecting never drains.
    pub fn run_until_idle(&self, max_timers: usize) -> bool {
        for _ in 0..max_timers {
            let Some(deadline) = self.next_deadline() else { return true };
            self.fire_next(deadline);
        }
        self.pending_timers() == 0
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.inner.timers.borrow().keys().next().map(|(deadline, _)| *deadline)
    }

    fn fire_next(&self, limit: Duration) -> bool {
        let entry = {
            let mut timers = self.inner.timers.borrow_mut();
            match timers.first_key_value() {
                Some((&(deadline, _), _)) if deadline <= limit => timers.pop_first(),
                _ => None,
            }
        };
        let Some(((deadline, id), callback)) = entry else { return false };

        self.inner.deadlines.borrow_mut().remove(&id);
        if deadline > self.inner.now.get() {
            self.inner.now.set(deadline);
        }
        self.inner.fired.set(self.inner.fired.get() + 1);
        callback();
        true
    }
}

impl Environment for SimEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.inner.now.get()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.rng.borrow_mut().fill_bytes(buffer);
    }

    fn set_timer(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = self.inner.next_timer.get();
        self.inner.next_timer.set(id + 1);

        let deadline = self.inner.now.get() + delay;
        self.inner.timers.borrow_mut().insert((deadline, id), callback);
        self.inner.deadlines.borrow_mut().insert(id, deadline);
        TimerId(id)
    }

    fn cancel_timer(&self, id: TimerId) {
        let deadline = self.inner.deadlines.borrow_mut().remove(&id.0);
        if let Some(deadline) = deadline {
            self.inner.timers.borrow_mut().remove(&(deadline, id.0));
        }
    }
}

impl fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEnv")
            .field("now", &self.inner.now.get())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order() {
        let env = SimEnv::with_seed(1);
        let log = Rc::new(RefCell::new(Vec::new()));

        for (name, ms) in [("late", 30), ("early", 10), ("tie-a", 20), ("tie-b", 20)] {
            let log = Rc::clone(&log);
            env.set_timer(Duration::from_millis(ms), Box::new(move || log.borrow_mut().push(name)));
        }

        env.advance(Duration::from_millis(25));
        assert_eq!(*log.borrow(), vec!["early", "tie-a", "tie-b"]);
        assert_eq!(env.elapsed(), Duration::from_millis(25));

        env.advance(Duration::from_millis(5));
        assert_eq!(*log.borrow(), vec!["early", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn zero_delay_timer_waits_for_settle() {
        let env = SimEnv::with_seed(1);
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);

        env.set_timer(Duration::ZERO, Box::new(move || f.set(true)));
        assert!(!fired.get());

        env.settle();
        assert!(fired.get());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let env = SimEnv::with_seed(1);
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);

        let id = env.set_timer(Duration::from_millis(5), Box::new(move || f.set(true)));
        env.cancel_timer(id);
        env.cancel_timer(id);
        env.advance(Duration::from_secs(1));

        assert!(!fired.get());
        assert_eq!(env.pending_timers(), 0);
    }

    #[test]
    fn callbacks_can_arm_timers() {
        let env = SimEnv::with_seed(1);
        let count = Rc::new(Cell::new(0));

        fn tick(env: SimEnv, count: Rc<Cell<u32>>) {
            count.set(count.get() + 1);
            if count.get() < 3 {
                let next = env.clone();
                env.set_timer(Duration::from_millis(10), Box::new(move || tick(next, count)));
            }
        }

        let (e, c) = (env.clone(), Rc::clone(&count));
        env.set_timer(Duration::from_millis(10), Box::new(move || tick(e, c)));
        env.advance(Duration::from_millis(100));

        assert_eq!(count.get(), 3);
        assert!(env.run_until_idle(10));
    }

    #[test]
    fn same_seed_same_randomness() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_hex(16), b.random_hex(16));
        assert_ne!(a.random_u64(), SimEnv::with_seed(43).random_u64());
    }
}
