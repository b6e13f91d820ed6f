//! Mode selection.

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::identity::Identity;
use crate::signal::SignalTable;
use crate::supervisor::Supervisor;
use crate::worker::Worker;

/// The role of this process, chosen once at startup.
pub enum Process {
    Supervisor(Supervisor),
    Worker(Worker),
}

impl Process {
    /// Pick the role from the inherited identity state.
    pub fn select(config: Arc<Config>) -> Result<Self> {
        let signals = SignalTable::resolve(config.resolved_restart_signal())?;

        match Identity::from_env()? {
            Some(identity) => {
                debug!(generation = identity.worker_id, "Running as worker");
                Ok(Process::Worker(Worker::new(config, identity, signals)))
            }
            None => {
                debug!("Running as supervisor");
                Ok(Process::Supervisor(Supervisor::new(config, signals)))
            }
        }
    }

    /// Run this process's side of the protocol; returns the code to exit with.
    pub async fn run(&self) -> Result<i32> {
        match self {
            Process::Supervisor(supervisor) => supervisor.run().await,
            Process::Worker(worker) => worker.run().await,
        }
    }

    pub fn trigger_restart(&self) {
        match self {
            Process::Supervisor(supervisor) => supervisor.trigger_restart(),
            Process::Worker(worker) => worker.trigger_restart(),
        }
    }
}
