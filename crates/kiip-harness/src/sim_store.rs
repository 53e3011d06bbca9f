//! Shared in-memory store with per-instance handles.
//!
//! Models a browser's local storage shared by several tabs: every instance
//! gets its own [`SimStoreHandle`], writes are visible to all handles at once,
//! and change notifications reach the *other* handles asynchronously (on the
//! next [`SimEnv`] turn). Writes that do not change the value notify nobody.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    rc::{Rc, Weak},
    time::Duration,
};

use kiip_core::{Environment, KeyValueStore, SharedStore, StoreChange, Subscribers, Subscription};

use crate::SimEnv;

struct Watcher {
    handle: u64,
    listeners: Weak<Subscribers<StoreChange>>,
}

struct Inner {
    env: SimEnv,
    data: RefCell<BTreeMap<String, String>>,
    watchers: RefCell<Vec<Watcher>>,
    next_handle: Cell<u64>,
    writes: Cell<u64>,
}

impl Inner {
    fn notify_others(&self, origin: u64, change: StoreChange) {
        let targets: Vec<_> = self
            .watchers
            .borrow()
            .iter()
            .filter(|w| w.handle != origin)
            .map(|w| Weak::clone(&w.listeners))
            .collect();

        for target in targets {
            let change = change.clone();
            self.env.set_timer(
                Duration::ZERO,
                Box::new(move || {
                    if let Some(listeners) = target.upgrade() {
                        listeners.emit(&change);
                    }
                }),
            );
        }
    }
}

/// The shared store itself. Create one handle per simulated instance.
#[derive(Clone)]
pub struct SimStore {
    inner: Rc<Inner>,
}

impl SimStore {
    /// Empty store delivering notifications through `env`.
    pub fn new(env: &SimEnv) -> Self {
        Self {
            inner: Rc::new(Inner {
                env: env.clone(),
                data: RefCell::new(BTreeMap::new()),
                watchers: RefCell::new(Vec::new()),
                next_handle: Cell::new(0),
                writes: Cell::new(0),
            }),
        }
    }

    /// New instance view of the store.
    pub fn handle(&self) -> SimStoreHandle {
        let id = self.inner.next_handle.get();
        self.inner.next_handle.set(id + 1);

        let listeners = Rc::new(Subscribers::new());
        self.inner.watchers.borrow_mut().push(Watcher { handle: id, listeners: Rc::downgrade(&listeners) });
        SimStoreHandle { store: Rc::clone(&self.inner), id, listeners }
    }

    /// Value of `key`, as any instance would read it.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.inner.data.borrow().get(key).cloned()
    }

    /// Write from outside every instance; all handles are notified.
    pub fn inject(&self, key: &str, value: Option<&str>) {
        let changed = {
            let mut data = self.inner.data.borrow_mut();
            match value {
                Some(value) => data.insert(key.to_string(), value.to_string()).as_deref() != Some(value),
                None => data.remove(key).is_some(),
            }
        };
        if changed {
            let change = StoreChange { key: key.to_string(), new_value: value.map(str::to_string) };
            self.inner.notify_others(u64::MAX, change);
        }
    }

    /// Number of writes that changed a value.
    pub fn writes(&self) -> u64 {
        self.inner.writes.get()
    }
}

impl fmt::Debug for SimStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimStore").field("data", &self.inner.data.borrow()).finish()
    }
}

/// One instance's view of a [`SimStore`].
#[derive(Clone)]
pub struct SimStoreHandle {
    store: Rc<Inner>,
    id: u64,
    listeners: Rc<Subscribers<StoreChange>>,
}

impl SimStoreHandle {
    fn write(&self, key: &str, value: Option<&str>) {
        let changed = {
            let mut data = self.store.data.borrow_mut();
            match value {
                Some(value) => data.insert(key.to_string(), value.to_string()).as_deref() != Some(value),
                None => data.remove(key).is_some(),
            }
        };
        if !changed {
            return;
        }

        self.store.writes.set(self.store.writes.get() + 1);
        tracing::trace!(handle = self.id, key, ?value, "Store write");
        let change = StoreChange { key: key.to_string(), new_value: value.map(str::to_string) };
        self.store.notify_others(self.id, change);
    }
}

impl KeyValueStore for SimStoreHandle {
    fn get(&self, key: &str) -> Option<String> {
        self.store.data.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.write(key, Some(value));
    }

    fn remove(&self, key: &str) {
        self.write(key, None);
    }
}

impl SharedStore for SimStoreHandle {
    fn watch(&self, listener: Box<dyn Fn(&StoreChange)>) -> Subscription {
        self.listeners.subscribe(listener)
    }
}

impl fmt::Debug for SimStoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimStoreHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(handle: &SimStoreHandle) -> (Rc<RefCell<Vec<StoreChange>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let sub = handle.watch(Box::new(move |change| s.borrow_mut().push(change.clone())));
        (seen, sub)
    }

    #[test]
    fn writes_notify_other_handles_only() {
        let env = SimEnv::with_seed(0);
        let store = SimStore::new(&env);
        let (a, b) = (store.handle(), store.handle());
        let (seen_a, _sa) = recorder(&a);
        let (seen_b, _sb) = recorder(&b);

        a.set("k", "v1");
        assert_eq!(b.get("k").as_deref(), Some("v1"));
        assert!(seen_b.borrow().is_empty());

        env.settle();
        assert!(seen_a.borrow().is_empty());
        assert_eq!(*seen_b.borrow(), vec![StoreChange { key: "k".into(), new_value: Some("v1".into()) }]);
    }

    #[test]
    fn unchanged_writes_are_silent() {
        let env = SimEnv::with_seed(0);
        let store = SimStore::new(&env);
        let (a, b) = (store.handle(), store.handle());
        let (seen_b, _sb) = recorder(&b);

        a.set("k", "v");
        a.set("k", "v");
        a.remove("missing");
        env.settle();

        assert_eq!(seen_b.borrow().len(), 1);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn removal_is_reported_as_none() {
        let env = SimEnv::with_seed(0);
        let store = SimStore::new(&env);
        let (a, b) = (store.handle(), store.handle());
        let (seen_b, _sb) = recorder(&b);

        a.set("k", "v");
        a.remove("k");
        env.settle();

        assert_eq!(seen_b.borrow().last(), Some(&StoreChange { key: "k".into(), new_value: None }));
        assert_eq!(store.peek("k"), None);
    }

    #[test]
    fn dropped_handle_stops_receiving() {
        let env = SimEnv::with_seed(0);
        let store = SimStore::new(&env);
        let a = store.handle();
        let (seen_b, sub) = {
            let b = store.handle();
            recorder(&b)
        };

        a.set("k", "v");
        env.settle();
        assert!(seen_b.borrow().is_empty());
        sub.unsubscribe();
    }
}
