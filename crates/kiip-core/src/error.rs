//! Runtime error types.

use thiserror::Error;

/// Errors returned by [`crate::MachineHandle`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// Shortcut target is not declared for the state owning the effect.
    #[error("shortcut from {from} to {to} is not declared")]
    UndeclaredShortcut {
        /// Tag of the state that issued the shortcut.
        from: String,
        /// Tag of the requested target.
        to: String,
    },

    /// The state that created the handle has already been left.
    #[error("effect outlived its state")]
    StaleEffect,

    /// The machine was destroyed.
    #[error("machine destroyed")]
    Destroyed,
}

impl MachineError {
    /// Whether the error comes from a late callback rather than a wrong
    /// transition table.
    ///
    /// Late callbacks are expected (a response arriving after the user moved
    /// on) and are safe to ignore.
    pub fn is_late(&self) -> bool {
        matches!(self, Self::StaleEffect | Self::Destroyed)
    }
}
