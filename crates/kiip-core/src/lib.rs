//! Kiip client coordination core
//!
//! Keeps one resilient connection to the server, drives the login handshake
//! over it, and elects a single leader among the application instances that
//! share a local store.
//!
//! # Architecture
//!
//! Everything in this crate is single-threaded and callback driven. External
//! input arrives as socket events, timer expirations and store-change
//! notifications; each callback runs to completion before the next one.
//! Time, randomness and timers come from an [`Environment`], so the same code
//! runs against the tokio runtime in production and against a virtual clock
//! in simulation.
//!
//! # Components
//!
//! - [`machine`]: Generic effect-driven state machine runtime
//! - [`transport`]: Self-healing socket wrapper with typed framing
//! - [`election`]: Leader election over a shared key-value store
//! - [`protocol`]: Connection and authentication machines
//! - [`mod@env`]: Environment abstraction (time, RNG, timers)
//! - [`store`]: Key-value store interfaces
//! - [`subscription`]: Listener lists and cleanup handles
//! - [`error`]: Runtime error types

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod election;
pub mod env;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod store;
pub mod subscription;
pub mod transport;

pub use election::{ActivityRank, Bid, ElectionConfig, LeaderElection};
pub use env::{Environment, TimerId};
pub use error::MachineError;
pub use machine::{MachineConfig, MachineHandle, StateConfig, StateMachine, Tagged};
pub use protocol::{AuthEvent, AuthState, ConnectionEvent, ConnectionProtocol, ConnectionState};
pub use store::{KeyValueStore, SessionStore, SharedStore, StoreChange};
pub use subscription::{Cleanup, Subscribers, Subscription};
pub use transport::{
    ConnectivityState, KiipTransport, MessageHandlers, ReconnectPolicy, ResilientTransport, Socket,
    SocketEvent, SocketEvents, SocketFactory, TransportConfig, TransportEvent,
};
