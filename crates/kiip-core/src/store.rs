//! Key-value store interfaces.
//!
//! The session token and the election records live in a string-keyed store
//! shared by every instance running on the same machine. The core only reads
//! and writes through these traits; backends live in the embedding crates.

use std::rc::Rc;

use crate::subscription::Subscription;

/// Synchronous string key-value store.
///
/// Operations are best effort: a backend that cannot persist a write logs the
/// failure and behaves as if the write was lost.
pub trait KeyValueStore {
    /// Current value of `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`.
    fn set(&self, key: &str, value: &str);

    /// Delete `key`. Deleting an absent key is a no-op.
    fn remove(&self, key: &str);
}

/// Write observed on a [`SharedStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Key that changed.
    pub key: String,
    /// Value after the write, `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Store shared between instances, with change notifications.
///
/// `watch` delivers writes made by *other* instances only. A write that does
/// not change the stored value may or may not be delivered.
pub trait SharedStore: KeyValueStore {
    /// Observe writes made by other instances.
    fn watch(&self, listener: Box<dyn Fn(&StoreChange)>) -> Subscription;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Rc<S> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) {
        (**self).set(key, value);
    }

    fn remove(&self, key: &str) {
        (**self).remove(key);
    }
}

impl<S: SharedStore + ?Sized> SharedStore for Rc<S> {
    fn watch(&self, listener: Box<dyn Fn(&StoreChange)>) -> Subscription {
        (**self).watch(listener)
    }
}

/// Shared handle to the store holding the session token.
pub type SessionStore = Rc<dyn KeyValueStore>;
