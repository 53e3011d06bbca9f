//! Client error types.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors from the file-backed store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the store directory failed.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Key cannot be mapped to a file name.
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Errors that stop the client binary.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The store directory is unusable.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reading commands or writing output failed.
    #[error("console I/O error: {0}")]
    Console(#[from] io::Error),

    /// Invalid command-line configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
