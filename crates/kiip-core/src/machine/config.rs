//! Declarative transition tables.

use std::{collections::HashMap, fmt};

use super::{MachineEvent, MachineHandle, MachineState};
use crate::subscription::Cleanup;

pub(crate) type TransitionFn<S, E> = Box<dyn Fn(E, &S) -> Option<S>>;
pub(crate) type EffectFn<S, E> = Box<dyn Fn(&S, &MachineHandle<S, E>) -> Option<Cleanup>>;

/// Behaviour of a single state.
pub struct StateConfig<S: MachineState, E: MachineEvent> {
    pub(crate) transitions: HashMap<E::Tag, TransitionFn<S, E>>,
    pub(crate) effect: Option<EffectFn<S, E>>,
    pub(crate) shortcuts: Vec<S::Tag>,
}

impl<S: MachineState, E: MachineEvent> StateConfig<S, E> {
    /// State that accepts no event and has no effect.
    pub fn new() -> Self {
        Self { transitions: HashMap::new(), effect: None, shortcuts: Vec::new() }
    }

    /// Accept events tagged `event`.
    ///
    /// `transition` returns the next state, or `None` to ignore the event.
    /// Returning a state equal to the current one is also a no-op.
    pub fn on(mut self, event: E::Tag, transition: impl Fn(E, &S) -> Option<S> + 'static) -> Self {
        self.transitions.insert(event, Box::new(transition));
        self
    }

    /// Run `effect` each time the state is entered.
    ///
    /// The returned cleanup runs when the state is left or the machine is
    /// destroyed.
    pub fn effect(
        mut self,
        effect: impl Fn(&S, &MachineHandle<S, E>) -> Option<Cleanup> + 'static,
    ) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }

    /// Allow the effect to shortcut to any of `targets`.
    pub fn shortcuts(mut self, targets: impl IntoIterator<Item = S::Tag>) -> Self {
        self.shortcuts.extend(targets);
        self
    }

    pub(crate) fn allows_shortcut(&self, target: S::Tag) -> bool {
        self.shortcuts.contains(&target)
    }
}

impl<S: MachineState, E: MachineEvent> Default for StateConfig<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MachineState, E: MachineEvent> fmt::Debug for StateConfig<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateConfig")
            .field("events", &self.transitions.keys().collect::<Vec<_>>())
            .field("effect", &self.effect.is_some())
            .field("shortcuts", &self.shortcuts)
            .finish()
    }
}

/// Transition table of a machine, keyed by state tag.
///
/// States without an entry accept no event and run no effect.
pub struct MachineConfig<S: MachineState, E: MachineEvent> {
    pub(crate) name: String,
    pub(crate) states: HashMap<S::Tag, StateConfig<S, E>>,
}

impl<S: MachineState, E: MachineEvent> MachineConfig<S, E> {
    /// Empty table. `name` only appears in logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), states: HashMap::new() }
    }

    /// Configure the state tagged `tag`, replacing a previous entry.
    pub fn state(mut self, tag: S::Tag, config: StateConfig<S, E>) -> Self {
        self.states.insert(tag, config);
        self
    }

    pub(crate) fn transition_for(&self, state: &S, event: E::Tag) -> Option<&TransitionFn<S, E>> {
        self.states.get(&state.tag()).and_then(|c| c.transitions.get(&event))
    }

    pub(crate) fn effect_for(&self, state: &S) -> Option<&EffectFn<S, E>> {
        self.states.get(&state.tag()).and_then(|c| c.effect.as_ref())
    }

    pub(crate) fn allows_shortcut(&self, from: S::Tag, to: S::Tag) -> bool {
        self.states.get(&from).is_some_and(|c| c.allows_shortcut(to))
    }
}

impl<S: MachineState, E: MachineEvent> fmt::Debug for MachineConfig<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineConfig").field("name", &self.name).field("states", &self.states).finish()
    }
}
