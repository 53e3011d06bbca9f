//! Effect-driven finite state machines.
//!
//! A machine owns exactly one state. Events are routed through a declarative
//! transition table ([`MachineConfig`]); entering a state runs the effect
//! configured for it, and leaving the state runs the cleanup that effect
//! returned. Effects talk back to their machine through a [`MachineHandle`],
//! which can force a declared *shortcut* transition or emit follow-up events.
//!
//! # Invariants
//!
//! - At most one effect cleanup is live per machine at any time
//! - Subscribers only observe fully entered states (effect already running)
//! - Work triggered while a transition is in progress is queued and applied,
//!   in order, before the outermost call returns
//! - After [`StateMachine::destroy`] no effect runs and no subscriber is called

mod config;
mod runtime;

use std::{fmt::Debug, hash::Hash};

pub use config::{MachineConfig, StateConfig};
pub use runtime::{MachineHandle, StateMachine};

/// Values with a fieldless discriminator.
///
/// States and events are routed by tag; payload fields never affect which
/// table entry applies.
pub trait Tagged {
    /// Discriminator type, usually a fieldless mirror enum.
    type Tag: Copy + Eq + Hash + Debug + 'static;

    /// Discriminator of this value.
    fn tag(&self) -> Self::Tag;
}

/// Requirements on machine states.
pub trait MachineState: Tagged + Clone + PartialEq + Debug + 'static {}

impl<T: Tagged + Clone + PartialEq + Debug + 'static> MachineState for T {}

/// Requirements on machine events.
pub trait MachineEvent: Tagged + Debug + 'static {}

impl<T: Tagged + Debug + 'static> MachineEvent for T {}
