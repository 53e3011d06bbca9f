//! Kiip production client.
//!
//! Runs the [`kiip_core`] coordination logic on a tokio `LocalSet`: timers and
//! randomness come from [`SystemEnv`], sockets from tokio-tungstenite, and the
//! election and session records live in a directory shared by every instance
//! on the machine.
//!
//! # Components
//!
//! - [`Client`]: Wires election, transport and protocol together
//! - [`SystemEnv`]: Production environment (real time, OS RNG, local timers)
//! - [`WsSocketFactory`]: WebSocket sockets for the resilient transport
//! - [`FileStore`]: Directory-backed shared store with polling watchers
//! - [`Command`]: Console command parser

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod command;
mod error;
pub mod file_store;
mod runtime;
mod system_env;
mod ws;

pub use command::{Command, CommandError};
pub use error::{ClientError, StoreError};
pub use file_store::FileStore;
pub use runtime::{
    Client, ClientConfig, ClientElection, DEFAULT_STORE_DIR, DEFAULT_URL, run_console, shutdown_signal,
};
pub use system_env::SystemEnv;
pub use ws::{WsSocket, WsSocketFactory};
