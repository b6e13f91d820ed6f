//! # overseer
//!
//! Zero-downtime restarts for socket servers, using a supervisor process that owns the
//! listening sockets.
//!
//! ## Overview
//!
//! [`run`] turns the calling process into a supervisor which:
//! 1. Binds every configured address once and keeps the descriptors for its whole lifetime
//! 2. Re-executes its own binary as a worker generation, passing the descriptors at fds `3..`
//! 3. On the restart signal, asks the current generation to step down and, once it has
//!    acknowledged, spawns the next generation on the same descriptors
//! 4. Forwards all other signals to the current generation and exits with its exit code
//!
//! Inside a worker, the same [`run`] call hosts the program: it is handed a [`State`] with
//! the inherited [`GracefulListener`]s and a shutdown token that fires when the supervisor
//! asks the generation to step down.
//!
//! ```no_run
//! # async fn example() {
//! let config = overseer::Config::new(|state: overseer::State| async move {
//!     let Some(listener) = state.listener() else { return };
//!     loop {
//!         tokio::select! {
//!             _ = state.graceful_shutdown().cancelled() => break,
//!             accepted = listener.accept() => {
//!                 let Ok((_stream, _peer)) = accepted else { break };
//!             }
//!         }
//!     }
//! })
//! .address(":3000");
//!
//! overseer::run(config).await;
//! # }
//! ```
//!
//! ## Signal Conventions
//!
//! - `SIGUSR2` (configurable): graceful restart
//! - `SIGUSR1`: restart acknowledgement, worker to supervisor
//! - `SIGKILL`: sent to a generation that does not acknowledge within the terminate timeout
//!
//! ## Environment Variables
//!
//! - `OVERSEER_TERMINATE_TIMEOUT_SECS`, `OVERSEER_RESTART_SIGNAL`: see [`Config`]
//! - `OVERSEER_IS_WORKER`, `OVERSEER_WORKER_ID`, `OVERSEER_NUM_FDS`, `OVERSEER_BIN_PATH`,
//!   `OVERSEER_SUPERVISOR_PID`: set by the supervisor for each generation
//!
//! ## Platform
//!
//! Unix only. Elsewhere [`run_err`] fails with [`Error::Unsupported`] and [`run`] runs the
//! program directly.

mod config;
mod error;
mod identity;
mod listener;
mod signal;
mod state;
pub mod telemetry;

#[cfg(unix)]
mod descriptor;
#[cfg(unix)]
mod process;
#[cfg(unix)]
mod supervisor;
#[cfg(unix)]
mod worker;

#[cfg(unix)]
use std::sync::{Arc, OnceLock};

use tracing::{error, warn};

pub use config::{Config, Program, DEFAULT_RESTART_SIGNAL, DEFAULT_TERMINATE_TIMEOUT};
pub use error::{Error, Result};
pub use identity::{is_supervisor, is_worker, worker_id, Identity};
pub use listener::{GracefulListener, KEEPALIVE_PERIOD};
pub use signal::{is_supported, Signal, SignalTable};
pub use state::State;

#[cfg(unix)]
pub use descriptor::{DescriptorSet, FIRST_INHERITED_FD};
#[cfg(unix)]
pub use process::Process;
#[cfg(unix)]
pub use supervisor::{Generation, Supervisor};
#[cfg(unix)]
pub use worker::Worker;

/// The process role, installed once by [`run_err`] so [`restart`] can reach it.
#[cfg(unix)]
static CURRENT: OnceLock<Arc<Process>> = OnceLock::new();

/// Run the protocol, or the program directly if it cannot start.
///
/// Never returns while the protocol runs: the process exits with the code [`run_err`]
/// returns. Startup errors in the supervisor fall back to calling the program with
/// [`State::disabled`], unless `required` is set, in which case they are fatal.
/// Errors inside a worker generation are always fatal.
pub async fn run(config: Config) {
    telemetry::init(config.debug, config.no_warn);

    let fallback = config.clone();
    match run_err(config).await {
        Ok(code) => std::process::exit(code),
        Err(err) if fallback.required || !err.is_startup() || is_worker() => {
            error!(error = %err, "overseer failed");
            std::process::exit(1);
        }
        Err(err) => {
            if fallback.warnings_enabled() {
                warn!(error = %err, "overseer disabled, running program directly");
            }
            (fallback.program)(State::disabled()).await;
        }
    }
}

/// Run the protocol, returning the code this process should exit with.
///
/// May only be called once per process.
#[cfg(unix)]
pub async fn run_err(config: Config) -> Result<i32> {
    let config = Arc::new(config.validated()?);
    config.log_config();

    let process = Arc::new(Process::select(config)?);
    if CURRENT.set(Arc::clone(&process)).is_err() {
        return Err(Error::InvalidConfig("overseer is already running".to_string()));
    }

    process.run().await
}

/// Run the protocol, returning the code this process should exit with.
#[cfg(not(unix))]
pub async fn run_err(config: Config) -> Result<i32> {
    config.validated()?;
    Err(Error::Unsupported(std::env::consts::OS))
}

/// Trigger a graceful restart.
///
/// From a worker this asks the supervisor to replace the current generation. Does nothing
/// before [`run`] has started, or when running without the protocol.
pub fn restart() {
    #[cfg(unix)]
    {
        if let Some(process) = CURRENT.get() {
            process.trigger_restart();
        }
    }
}
