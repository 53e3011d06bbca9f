//! Machine runtime: transitions, effects, re-entrancy.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use tracing::{debug, trace, warn};

use super::{MachineConfig, MachineEvent, MachineState};
use crate::{
    error::MachineError,
    subscription::{Cleanup, Subscribers, Subscription},
};

enum Command<S, E> {
    /// Event from outside or from an effect. `origin` is the generation of
    /// the effect that emitted it.
    Emit { event: E, origin: Option<u64> },
    /// Forced transition requested by the effect of generation `origin`.
    Shortcut { target: S, origin: u64 },
}

/// Resets the running flag even if a callback panics.
struct RunGuard<'a>(&'a Cell<bool>);

impl<'a> RunGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

struct Core<S: MachineState, E: MachineEvent> {
    config: MachineConfig<S, E>,
    state: RefCell<S>,
    cleanup: RefCell<Option<Cleanup>>,
    /// Incremented on every state entry; binds handles to the entry that
    /// created them.
    generation: Cell<u64>,
    subscribers: Subscribers<S>,
    queue: RefCell<VecDeque<Command<S, E>>>,
    running: Cell<bool>,
    destroyed: Cell<bool>,
}

impl<S: MachineState, E: MachineEvent> Core<S, E> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn dispatch(self: &Rc<Self>, command: Command<S, E>) {
        self.queue.borrow_mut().push_back(command);
        if !self.running.get() {
            self.drain();
        }
    }

    fn drain(self: &Rc<Self>) {
        let _guard = RunGuard::enter(&self.running);
        loop {
            if self.destroyed.get() {
                self.queue.borrow_mut().clear();
                break;
            }
            let next = self.queue.borrow_mut().pop_front();
            let Some(command) = next else { break };
            self.apply(command);
        }
    }

    fn apply(self: &Rc<Self>, command: Command<S, E>) {
        match command {
            Command::Emit { event, origin } => {
                if origin.is_some_and(|g| g != self.generation.get()) {
                    debug!(machine = %self.name(), event = ?event.tag(), "Dropping event from stale effect");
                    return;
                }

                let current = self.state.borrow().clone();
                let Some(transition) = self.config.transition_for(&current, event.tag()) else {
                    debug!(
                        machine = %self.name(),
                        state = ?current.tag(),
                        event = ?event.tag(),
                        "Event ignored"
                    );
                    return;
                };

                let event_tag = event.tag();
                match transition(event, &current) {
                    Some(next) if next != current => {
                        trace!(machine = %self.name(), event = ?event_tag, "Transition");
                        self.transition(next);
                    },
                    _ => {
                        trace!(machine = %self.name(), state = ?current.tag(), event = ?event_tag, "No state change");
                    },
                }
            },
            Command::Shortcut { target, origin } => {
                if origin != self.generation.get() {
                    debug!(machine = %self.name(), target = ?target.tag(), "Dropping shortcut from stale effect");
                    return;
                }
                self.transition(target);
            },
        }
    }

    fn transition(self: &Rc<Self>, next: S) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            cleanup.run();
        }
        if self.destroyed.get() {
            debug!(machine = %self.name(), to = ?next.tag(), "Destroyed during cleanup; transition dropped");
            return;
        }

        let from = self.state.replace(next.clone()).tag();
        debug!(machine = %self.name(), from = ?from, to = ?next.tag(), "State entered");

        self.enter(&next);
        self.subscribers.emit(&next);
    }

    fn enter(self: &Rc<Self>, state: &S) {
        if self.destroyed.get() {
            return;
        }
        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let Some(effect) = self.config.effect_for(state) else { return };
        let handle = MachineHandle { core: Rc::downgrade(self), generation, tag: state.tag() };
        let cleanup = effect(state, &handle);

        match cleanup {
            Some(cleanup) if self.destroyed.get() => cleanup.run(),
            Some(cleanup) => {
                if let Some(previous) = self.cleanup.replace(Some(cleanup)) {
                    previous.run();
                }
            },
            None => {},
        }
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        debug!(machine = %self.name(), "Destroyed");

        self.queue.borrow_mut().clear();
        self.subscribers.clear();
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            cleanup.run();
        }
    }
}

/// Running instance of a [`MachineConfig`].
///
/// Cheap to clone; clones share the same instance. Equality is identity.
pub struct StateMachine<S: MachineState, E: MachineEvent> {
    core: Rc<Core<S, E>>,
}

impl<S: MachineState, E: MachineEvent> StateMachine<S, E> {
    /// Create a machine in `initial` and run that state's effect.
    pub fn new(initial: S, config: MachineConfig<S, E>) -> Self {
        let core = Rc::new(Core {
            config,
            state: RefCell::new(initial.clone()),
            cleanup: RefCell::new(None),
            generation: Cell::new(0),
            subscribers: Subscribers::new(),
            queue: RefCell::new(VecDeque::new()),
            running: Cell::new(false),
            destroyed: Cell::new(false),
        });

        {
            let _guard = RunGuard::enter(&core.running);
            core.enter(&initial);
        }
        // Shortcuts and events issued by the initial effect.
        core.drain();

        Self { core }
    }

    /// Feed an event into the machine.
    ///
    /// Events not accepted by the current state are ignored. When called
    /// while a transition is running, the event is applied after it.
    pub fn emit(&self, event: E) {
        if self.core.destroyed.get() {
            debug!(machine = %self.core.name(), event = ?event.tag(), "Event after destroy ignored");
            return;
        }
        self.core.dispatch(Command::Emit { event, origin: None });
    }

    /// Clone of the current state.
    pub fn state(&self) -> S {
        self.core.state.borrow().clone()
    }

    /// Tag of the current state.
    pub fn tag(&self) -> S::Tag {
        self.core.state.borrow().tag()
    }

    /// Observe the machine: `listener` gets the current state immediately,
    /// then every state entered afterwards.
    pub fn subscribe(&self, listener: impl Fn(&S) + 'static) -> Subscription {
        let listener = Rc::new(listener);
        let subscribed = Rc::clone(&listener);
        let subscription = self.core.subscribers.subscribe(move |state| subscribed(state));

        if !self.core.destroyed.get() {
            let snapshot = self.state();
            listener(&snapshot);
        }
        subscription
    }

    /// Tear down the live effect and detach every subscriber.
    ///
    /// Further events and shortcuts are ignored. Idempotent.
    pub fn destroy(&self) {
        self.core.destroy();
    }

    /// Whether [`StateMachine::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.get()
    }
}

impl<S: MachineState, E: MachineEvent> Clone for StateMachine<S, E> {
    fn clone(&self) -> Self {
        Self { core: Rc::clone(&self.core) }
    }
}

impl<S: MachineState, E: MachineEvent> PartialEq for StateMachine<S, E> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<S: MachineState, E: MachineEvent> fmt::Debug for StateMachine<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("StateMachine");
        s.field("name", &self.core.name());
        match self.core.state.try_borrow() {
            Ok(state) => s.field("state", &*state),
            Err(_) => s.field("state", &"<transitioning>"),
        };
        s.field("destroyed", &self.core.destroyed.get()).finish()
    }
}

/// Capability handed to an effect.
///
/// Bound to the state entry that ran the effect: once the machine leaves that
/// state, every call returns [`MachineError::StaleEffect`]. Holds only a weak
/// reference, so an effect never keeps its machine alive.
pub struct MachineHandle<S: MachineState, E: MachineEvent> {
    core: Weak<Core<S, E>>,
    generation: u64,
    tag: S::Tag,
}

impl<S: MachineState, E: MachineEvent> MachineHandle<S, E> {
    fn live(&self) -> Result<Rc<Core<S, E>>, MachineError> {
        let core = self.core.upgrade().ok_or(MachineError::Destroyed)?;
        if core.destroyed.get() {
            return Err(MachineError::Destroyed);
        }
        if core.generation.get() != self.generation {
            return Err(MachineError::StaleEffect);
        }
        Ok(core)
    }

    /// Force a transition to `target`.
    ///
    /// `target`'s tag must be declared in the owning state's shortcut list.
    pub fn shortcut(&self, target: S) -> Result<(), MachineError> {
        let core = self.live()?;
        if !core.config.allows_shortcut(self.tag, target.tag()) {
            let err = MachineError::UndeclaredShortcut {
                from: format!("{:?}", self.tag),
                to: format!("{:?}", target.tag()),
            };
            warn!(machine = %core.name(), error = %err, "Shortcut rejected");
            return Err(err);
        }

        core.dispatch(Command::Shortcut { target, origin: self.generation });
        Ok(())
    }

    /// Feed a follow-up event into the machine.
    pub fn emit(&self, event: E) -> Result<(), MachineError> {
        let core = self.live()?;
        core.dispatch(Command::Emit { event, origin: Some(self.generation) });
        Ok(())
    }

    /// Whether the machine is still in the state entry that created this
    /// handle.
    pub fn is_current(&self) -> bool {
        self.live().is_ok()
    }

    /// Tag of the state owning this handle.
    pub fn state_tag(&self) -> S::Tag {
        self.tag
    }

    /// The machine, unless it was dropped.
    pub fn machine(&self) -> Option<StateMachine<S, E>> {
        self.core.upgrade().map(|core| StateMachine { core })
    }
}

impl<S: MachineState, E: MachineEvent> Clone for MachineHandle<S, E> {
    fn clone(&self) -> Self {
        Self { core: Weak::clone(&self.core), generation: self.generation, tag: self.tag }
    }
}

impl<S: MachineState, E: MachineEvent> fmt::Debug for MachineHandle<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineHandle")
            .field("state", &self.tag)
            .field("generation", &self.generation)
            .finish()
    }
}
