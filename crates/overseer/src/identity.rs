//! Identity state handed from the supervisor to each worker generation.
//!
//! Conveyed once per spawn through environment variables and read once at worker startup.
//! The presence of the worker marker is what selects worker mode.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub(crate) const ENV_IS_WORKER: &str = "OVERSEER_IS_WORKER";
pub(crate) const ENV_WORKER_ID: &str = "OVERSEER_WORKER_ID";
pub(crate) const ENV_NUM_FDS: &str = "OVERSEER_NUM_FDS";
pub(crate) const ENV_BIN_PATH: &str = "OVERSEER_BIN_PATH";
pub(crate) const ENV_SUPERVISOR_PID: &str = "OVERSEER_SUPERVISOR_PID";

/// Who a worker generation is, as told by its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Monotonic generation id, starting at 1.
    pub worker_id: u64,
    /// Absolute path of the binary the supervisor re-executes.
    pub bin_path: PathBuf,
    /// Number of inherited listening descriptors, starting at fd 3.
    pub num_fds: usize,
    /// Pid of the supervisor that spawned this generation.
    pub supervisor_pid: i32,
}

impl Identity {
    /// Read the identity from the process environment.
    ///
    /// Returns `None` when the worker marker is absent (supervisor mode).
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(ENV_IS_WORKER).as_deref() != Some("1") {
            return Ok(None);
        }

        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                Error::Identity(format!("{ENV_IS_WORKER} is set but {key} is missing"))
            })
        };

        let worker_id = required(ENV_WORKER_ID)?
            .parse::<u64>()
            .map_err(|e| Error::Identity(format!("{ENV_WORKER_ID}: {e}")))?;
        let num_fds = required(ENV_NUM_FDS)?
            .parse::<usize>()
            .map_err(|e| Error::Identity(format!("{ENV_NUM_FDS}: {e}")))?;
        let supervisor_pid = required(ENV_SUPERVISOR_PID)?
            .parse::<i32>()
            .map_err(|e| Error::Identity(format!("{ENV_SUPERVISOR_PID}: {e}")))?;
        let bin_path = PathBuf::from(required(ENV_BIN_PATH)?);

        if worker_id == 0 {
            return Err(Error::Identity(format!("{ENV_WORKER_ID} must be at least 1")));
        }

        Ok(Some(Self {
            worker_id,
            bin_path,
            num_fds,
            supervisor_pid,
        }))
    }

    /// Environment variables that convey this identity to a new generation.
    pub(crate) fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_IS_WORKER, "1".to_string()),
            (ENV_WORKER_ID, self.worker_id.to_string()),
            (ENV_NUM_FDS, self.num_fds.to_string()),
            (ENV_BIN_PATH, self.bin_path.display().to_string()),
            (ENV_SUPERVISOR_PID, self.supervisor_pid.to_string()),
        ]
    }
}

/// Whether this process was started by a supervisor as a worker generation.
pub fn is_worker() -> bool {
    std::env::var(ENV_IS_WORKER).as_deref() == Ok("1")
}

/// Whether this process is (or would become) the supervisor.
pub fn is_supervisor() -> bool {
    !is_worker()
}

/// The current worker's generation id, or `None` in the supervisor.
pub fn worker_id() -> Option<u64> {
    if !is_worker() {
        return None;
    }
    std::env::var(ENV_WORKER_ID).ok()?.parse().ok()
}
