//! Errors raised while starting the supervisor or a worker generation.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by [`run_err`](crate::run_err).
#[derive(Error, Debug)]
pub enum Error {
    #[error("platform ({0}) not supported")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to find binary path: {0}")]
    BinaryPath(#[source] io::Error),

    #[error("invalid address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("inherited descriptor {fd} is unusable: {reason}")]
    Descriptor { fd: i32, reason: String },

    #[error("invalid identity state: {0}")]
    Identity(String),

    #[error("signal error: {0}")]
    Signal(String),

    #[error("failed to start worker process: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error happened before any worker generation was started.
    ///
    /// Only startup errors allow falling back to running the program directly;
    /// anything later means the supervisor already owned the sockets.
    pub fn is_startup(&self) -> bool {
        !matches!(self, Error::Spawn(_) | Error::Io(_))
    }
}
