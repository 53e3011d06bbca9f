//! Deterministic simulation harness for the Kiip client core.
//!
//! Virtual-time implementations of the core's seams: an [`kiip_core::Environment`]
//! with a seeded RNG and a manually advanced clock, a shared store with
//! per-tab handles, scripted sockets, and an in-memory login server. A run is
//! reproducible from its seed.
//!
//! # Clusters
//!
//! [`SimTabs`] runs several leader elections against one store. Take an
//! [`ElectionSnapshot`] once the election has settled and check it with an
//! [`InvariantRegistry`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod invariants;
pub mod sim_env;
pub mod sim_server;
pub mod sim_socket;
pub mod sim_store;

pub use cluster::{SimTabs, TabElection};
pub use invariants::{
    BestBidLeads, ElectionSnapshot, Invariant, InvariantRegistry, InvariantResult, LeaderOwnsRecord, SingleLeader,
    TabSnapshot, Violation,
};
pub use sim_env::SimEnv;
pub use sim_server::SimServer;
pub use sim_socket::{AcceptMode, Responder, SimSocketFactory};
pub use sim_store::{SimStore, SimStoreHandle};
