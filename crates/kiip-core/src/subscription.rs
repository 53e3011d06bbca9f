//! Listener lists and cleanup handles.
//!
//! [`Subscribers`] is the single fan-out primitive used by the transport, the
//! state machines and the election. Emitting iterates over a snapshot, so a
//! listener may subscribe, unsubscribe or emit re-entrantly. A listener that
//! is detached while an emit is in flight is not called afterwards.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

struct Listener<T: ?Sized> {
    id: u64,
    active: Cell<bool>,
    callback: Box<dyn Fn(&T)>,
}

type ListenerList<T> = RefCell<Vec<Rc<Listener<T>>>>;

/// Ordered list of listeners for values of type `T`.
pub struct Subscribers<T: ?Sized> {
    listeners: Rc<ListenerList<T>>,
    next_id: Cell<u64>,
}

impl<T: ?Sized + 'static> Subscribers<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self { listeners: Rc::new(RefCell::new(Vec::new())), next_id: Cell::new(0) }
    }

    /// Attach a listener. It stays attached until the returned handle is
    /// unsubscribed or the list is cleared.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let listener = Rc::new(Listener { id, active: Cell::new(true), callback: Box::new(callback) });
        self.listeners.borrow_mut().push(Rc::clone(&listener));

        let list: Weak<ListenerList<T>> = Rc::downgrade(&self.listeners);
        let listener = Rc::downgrade(&listener);
        Subscription::new(move || {
            if let Some(listener) = listener.upgrade() {
                listener.active.set(false);
            }
            if let Some(list) = list.upgrade() {
                list.borrow_mut().retain(|l| l.id != id);
            }
        })
    }

    /// Call every attached listener with `value`, in subscription order.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<_> = self.listeners.borrow().iter().cloned().collect();
        for listener in snapshot {
            if listener.active.get() {
                (listener.callback)(value);
            }
        }
    }

    /// Detach every listener.
    pub fn clear(&self) {
        let drained: Vec<_> = self.listeners.borrow_mut().drain(..).collect();
        for listener in drained {
            listener.active.set(false);
        }
    }

    /// Number of attached listeners.
    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Whether no listener is attached.
    pub fn is_empty(&self) -> bool {
        self.listeners.borrow().is_empty()
    }
}

impl<T: ?Sized + 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers").field("len", &self.listeners.borrow().len()).finish()
    }
}

/// Handle returned by every `subscribe`-style method.
///
/// Dropping the handle keeps the listener attached; call
/// [`Subscription::unsubscribe`] to detach it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Wrap a detach action.
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// Handle that detaches nothing.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Detach the listener.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("attached", &self.cancel.is_some()).finish()
    }
}

/// Teardown action bound to a state machine effect.
///
/// Runs exactly once: consumed by [`Cleanup::run`].
pub struct Cleanup(Box<dyn FnOnce()>);

impl Cleanup {
    /// Wrap a teardown action.
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self(Box::new(teardown))
    }

    /// Execute the teardown.
    pub fn run(self) {
        (self.0)();
    }
}

impl From<Subscription> for Cleanup {
    fn from(subscription: Subscription) -> Self {
        Self::new(move || subscription.unsubscribe())
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup")
    }
}
