//! Leader election over a shared key-value store.
//!
//! Instances running against the same [`SharedStore`] elect one leader using
//! two records and store-change notifications as the only channel:
//!
//! - `MASTER_TAB_REQUEST`: the latest bid for leadership
//! - `MASTER_TAB_ELECT`: the bid of the current (or claiming) leader
//!
//! A bid is `"<rank>-<identity>"` and the lexicographically smaller bid wins,
//! so a focused instance beats a visible one, which beats a hidden one, and
//! identities break ties.
//!
//! ```text
//!  request ──(request_timeout, unchallenged)──> claim ──(elect_timeout)──> leader
//!     ^                                                                      │
//!     └──────── ELECT removed / rank changed          better bid seen ───────┴──> follower
//! ```
//!
//! The protocol favours liveness over strict exclusion: two instances may
//! briefly disagree after a topology change, and a leader that disappears
//! without cleaning up is replaced once someone bids again. It converges to a
//! single leader within a few multiples of the timeouts.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    str::FromStr,
    time::Duration,
};

use crate::{
    env::{Environment, TimerId},
    store::{SharedStore, StoreChange},
    subscription::{Subscribers, Subscription},
};

/// Key holding the latest leadership request.
pub const REQUEST_KEY: &str = "MASTER_TAB_REQUEST";

/// Key holding the elected bid.
pub const ELECT_KEY: &str = "MASTER_TAB_ELECT";

/// Time a request must stay unchallenged before claiming.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Time a claim must survive before becoming leader.
pub const DEFAULT_ELECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of hex digits in an instance identity.
pub const IDENTITY_LEN: usize = 5;

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Wait after writing a request before claiming
    pub request_timeout: Duration,
    /// Wait after claiming before reporting leadership
    pub elect_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self { request_timeout: DEFAULT_REQUEST_TIMEOUT, elect_timeout: DEFAULT_ELECT_TIMEOUT }
    }
}

/// How much the user is interacting with an instance. Lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActivityRank {
    /// Visible and focused.
    Focused = 0,
    /// Visible without focus.
    Visible = 1,
    /// Not visible.
    Hidden = 2,
}

impl ActivityRank {
    /// Rank of a window with the given visibility and focus.
    pub fn from_window(visible: bool, focused: bool) -> Self {
        match (visible, focused) {
            (false, _) => Self::Hidden,
            (true, true) => Self::Focused,
            (true, false) => Self::Visible,
        }
    }

    /// Digit written in bids.
    pub fn digit(self) -> char {
        match self {
            Self::Focused => '0',
            Self::Visible => '1',
            Self::Hidden => '2',
        }
    }
}

impl fmt::Display for ActivityRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Focused => "focused",
            Self::Visible => "visible",
            Self::Hidden => "hidden",
        })
    }
}

impl FromStr for ActivityRank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "focused" | "0" => Ok(Self::Focused),
            "visible" | "1" => Ok(Self::Visible),
            "hidden" | "2" => Ok(Self::Hidden),
            other => Err(format!("unknown activity rank {other:?} (expected focused, visible or hidden)")),
        }
    }
}

/// Leadership bid, `"<rank digit>-<identity>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bid(String);

impl Bid {
    /// Bid of an instance with `identity` at `rank`.
    pub fn new(rank: ActivityRank, identity: &str) -> Self {
        Self(format!("{}-{identity}", rank.digit()))
    }

    /// Bid as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this bid wins against the stored bid `other`.
    ///
    /// Strict: a bid never beats itself.
    pub fn beats(&self, other: &str) -> bool {
        self.0.as_str() < other
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Bid {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

struct Inner<E: Environment, S: SharedStore> {
    env: E,
    store: S,
    config: ElectionConfig,
    id: String,
    rank: Cell<ActivityRank>,
    is_leader: Cell<bool>,
    request_timer: Cell<Option<TimerId>>,
    elect_timer: Cell<Option<TimerId>>,
    watch: RefCell<Option<Subscription>>,
    destroyed: Cell<bool>,
    subscribers: Subscribers<bool>,
}

impl<E: Environment, S: SharedStore + 'static> Inner<E, S> {
    fn bid(&self) -> Bid {
        Bid::new(self.rank.get(), &self.id)
    }

    fn on_store_change(self: &Rc<Self>, change: &StoreChange) {
        if self.destroyed.get() {
            return;
        }
        match change.key.as_str() {
            REQUEST_KEY => self.on_request(change.new_value.as_deref()),
            ELECT_KEY => self.on_elect(change.new_value.as_deref()),
            _ => {},
        }
    }

    /// Another instance asked for leadership.
    fn on_request(self: &Rc<Self>, request: Option<&str>) {
        let Some(request) = request else { return };
        let bid = self.bid();

        if !bid.beats(request) {
            tracing::debug!(%bid, request, "Outbid");
            self.demote();
            return;
        }

        match self.store.get(ELECT_KEY) {
            Some(elected) if !bid.beats(&elected) => {
                // The recorded leader may be gone; bid again so it answers.
                tracing::debug!(%bid, %elected, "Probing recorded leader");
                self.request();
            },
            _ => self.claim(),
        }
    }

    /// Another instance claimed leadership, or the leader stepped down.
    fn on_elect(self: &Rc<Self>, elected: Option<&str>) {
        let bid = self.bid();
        if elected == Some(bid.as_str()) {
            return;
        }
        self.demote();

        match elected {
            None => {
                tracing::debug!(%bid, "Leader stepped down");
                self.request();
            },
            // An inferior claim raced ours; demoting alone could leave nobody
            // with a pending timer.
            Some(elected) if bid.beats(elected) => {
                tracing::debug!(%bid, elected, "Challenging inferior claim");
                self.request();
            },
            Some(_) => {},
        }
    }

    fn request(self: &Rc<Self>) {
        self.cancel(&self.request_timer);
        let bid = self.bid();
        self.store.set(REQUEST_KEY, bid.as_str());

        let weak = Rc::downgrade(self);
        let timer = self.env.set_timer(
            self.config.request_timeout,
            Box::new(move || {
                let Some(inner) = live(&weak) else { return };
                inner.request_timer.set(None);
                inner.claim();
            }),
        );
        self.request_timer.set(Some(timer));
    }

    fn claim(self: &Rc<Self>) {
        let bid = self.bid();
        tracing::debug!(%bid, "Claiming leadership");
        self.store.set(ELECT_KEY, bid.as_str());

        self.cancel(&self.elect_timer);
        let weak = Rc::downgrade(self);
        let timer = self.env.set_timer(
            self.config.elect_timeout,
            Box::new(move || {
                let Some(inner) = live(&weak) else { return };
                inner.elect_timer.set(None);
                inner.confirm();
            }),
        );
        self.elect_timer.set(Some(timer));
    }

    fn confirm(&self) {
        let bid = self.bid();
        let elected = self.store.get(ELECT_KEY);
        if elected.as_deref() == Some(bid.as_str()) && !self.is_leader.get() {
            self.is_leader.set(true);
            tracing::info!(%bid, "Became leader");
            self.subscribers.emit(&true);
        }
    }

    fn demote(&self) {
        self.cancel(&self.request_timer);
        self.cancel(&self.elect_timer);
        if self.is_leader.replace(false) {
            tracing::info!(bid = %self.bid(), "Lost leadership");
            self.subscribers.emit(&false);
        }
    }

    fn cancel(&self, timer: &Cell<Option<TimerId>>) {
        if let Some(id) = timer.take() {
            self.env.cancel_timer(id);
        }
    }
}

fn live<E: Environment, S: SharedStore>(weak: &Weak<Inner<E, S>>) -> Option<Rc<Inner<E, S>>> {
    weak.upgrade().filter(|inner| !inner.destroyed.get())
}

/// One participant in the election.
///
/// Cheap to clone; clones share the same participant. Call
/// [`LeaderElection::destroy`] before shutting down so another instance can
/// take over without waiting for a new bid.
pub struct LeaderElection<E: Environment, S: SharedStore> {
    inner: Rc<Inner<E, S>>,
}

impl<E: Environment, S: SharedStore + 'static> LeaderElection<E, S> {
    /// Join the election with a fresh random identity and bid immediately.
    pub fn new(env: E, store: S, config: ElectionConfig, rank: ActivityRank) -> Self {
        let id = env.random_hex(IDENTITY_LEN);
        let inner = Rc::new(Inner {
            env,
            store,
            config,
            id,
            rank: Cell::new(rank),
            is_leader: Cell::new(false),
            request_timer: Cell::new(None),
            elect_timer: Cell::new(None),
            watch: RefCell::new(None),
            destroyed: Cell::new(false),
            subscribers: Subscribers::new(),
        });

        let weak = Rc::downgrade(&inner);
        let watch = inner.store.watch(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_store_change(change);
            }
        }));
        *inner.watch.borrow_mut() = Some(watch);

        tracing::info!(bid = %inner.bid(), "Joining election");
        inner.request();
        Self { inner }
    }

    /// Whether this instance currently leads.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.get()
    }

    /// Random identity, stable for the lifetime of the participant.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current bid.
    pub fn bid(&self) -> Bid {
        self.inner.bid()
    }

    /// Current activity rank.
    pub fn rank(&self) -> ActivityRank {
        self.inner.rank.get()
    }

    /// Report a new activity rank. Bids again when it changed.
    pub fn set_activity(&self, rank: ActivityRank) {
        if self.inner.destroyed.get() || self.inner.rank.get() == rank {
            return;
        }
        self.inner.cancel(&self.inner.request_timer);
        self.inner.cancel(&self.inner.elect_timer);
        self.inner.rank.set(rank);
        tracing::debug!(bid = %self.inner.bid(), "Activity changed");
        self.inner.request();
    }

    /// Observe leadership changes. Only transitions are reported.
    pub fn subscribe(&self, listener: impl Fn(&bool) + 'static) -> Subscription {
        self.inner.subscribers.subscribe(listener)
    }

    /// Leave the election.
    ///
    /// Clears the elected record when it holds this instance's bid, so the
    /// others start a new round at once. Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.replace(true) {
            return;
        }

        let watch = inner.watch.borrow_mut().take();
        if let Some(watch) = watch {
            watch.unsubscribe();
        }

        let bid = inner.bid();
        if inner.store.get(ELECT_KEY).as_deref() == Some(bid.as_str()) {
            inner.store.remove(ELECT_KEY);
        }
        inner.demote();
        inner.subscribers.clear();
        tracing::info!(%bid, "Left election");
    }

    /// Whether [`LeaderElection::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }
}

impl<E: Environment, S: SharedStore> Clone for LeaderElection<E, S> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<E: Environment, S: SharedStore> fmt::Debug for LeaderElection<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElection")
            .field("id", &self.inner.id)
            .field("rank", &self.inner.rank.get())
            .field("is_leader", &self.inner.is_leader.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_from_window() {
        assert_eq!(ActivityRank::from_window(true, true), ActivityRank::Focused);
        assert_eq!(ActivityRank::from_window(true, false), ActivityRank::Visible);
        assert_eq!(ActivityRank::from_window(false, true), ActivityRank::Hidden);
        assert_eq!(ActivityRank::from_window(false, false), ActivityRank::Hidden);
    }

    #[test]
    fn rank_parses_names_and_digits() {
        assert_eq!("focused".parse::<ActivityRank>(), Ok(ActivityRank::Focused));
        assert_eq!("1".parse::<ActivityRank>(), Ok(ActivityRank::Visible));
        assert_eq!(ActivityRank::Hidden.to_string().parse::<ActivityRank>(), Ok(ActivityRank::Hidden));
        assert!("minimized".parse::<ActivityRank>().is_err());
    }

    #[test]
    fn bid_format() {
        let bid = Bid::new(ActivityRank::Visible, "0a3f9");
        assert_eq!(bid.as_str(), "1-0a3f9");
        assert_eq!(bid.to_string(), "1-0a3f9");
    }

    #[test]
    fn rank_dominates_identity() {
        let focused = Bid::new(ActivityRank::Focused, "fffff");
        let visible = Bid::new(ActivityRank::Visible, "00000");
        assert!(focused.beats(visible.as_str()));
        assert!(!visible.beats(focused.as_str()));
    }

    #[test]
    fn identity_breaks_ties() {
        let a = Bid::new(ActivityRank::Hidden, "0000a");
        let b = Bid::new(ActivityRank::Hidden, "0000b");
        assert!(a.beats(b.as_str()));
        assert!(!b.beats(a.as_str()));
    }

    #[test]
    fn bid_never_beats_itself() {
        let bid = Bid::new(ActivityRank::Focused, "12345");
        assert!(!bid.beats(bid.as_str()));
    }
}
