//! The runtime state handed to the user program.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::listener::GracefulListener;

/// What the user program sees of its generation.
///
/// Listeners are shared with the worker runtime, which may close them when a restart is
/// requested with `single_accept`. The program may accept and close them, but the
/// underlying descriptors belong to the supervisor.
#[derive(Clone, Debug)]
pub struct State {
    enabled: bool,
    id: String,
    started_at: SystemTime,
    listeners: Vec<GracefulListener>,
    addresses: Vec<String>,
    graceful_shutdown: CancellationToken,
    bin_path: Option<PathBuf>,
}

impl State {
    pub(crate) fn worker(
        id: u64,
        listeners: Vec<GracefulListener>,
        addresses: Vec<String>,
        graceful_shutdown: CancellationToken,
        bin_path: PathBuf,
    ) -> Self {
        Self {
            enabled: true,
            id: id.to_string(),
            started_at: SystemTime::now(),
            listeners,
            addresses,
            graceful_shutdown,
            bin_path: Some(bin_path),
        }
    }

    /// State passed to the program when it runs directly, without a supervisor.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            id: String::new(),
            started_at: SystemTime::now(),
            listeners: Vec::new(),
            addresses: Vec::new(),
            graceful_shutdown: CancellationToken::new(),
            bin_path: None,
        }
    }

    /// Whether the program runs under a supervisor.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Generation id; empty when disabled.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Listener for the first configured address.
    pub fn listener(&self) -> Option<&GracefulListener> {
        self.listeners.first()
    }

    /// One listener per configured address, in configured order.
    pub fn listeners(&self) -> &[GracefulListener] {
        &self.listeners
    }

    /// Configured addresses, index-aligned with [`listeners`](Self::listeners).
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Cancelled when the supervisor asks this generation to step down.
    ///
    /// Programs should stop accepting new connections once this fires and return when
    /// their in-flight work has drained.
    pub fn graceful_shutdown(&self) -> &CancellationToken {
        &self.graceful_shutdown
    }

    /// Path of the binary being supervised.
    pub fn bin_path(&self) -> Option<&Path> {
        self.bin_path.as_deref()
    }
}
