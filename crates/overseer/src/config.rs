//! Run configuration.
//!
//! A [`Config`] is built once with its builder methods, optionally overlaid from the
//! environment, then validated and frozen when [`run`](crate::run) starts.
//!
//! # Environment Variables
//!
//! - `OVERSEER_TERMINATE_TIMEOUT_SECS`: terminate timeout in seconds (default: 30)
//! - `OVERSEER_RESTART_SIGNAL`: restart signal, by name or number (default: `SIGUSR2`)

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::state::State;

/// Default time a generation gets to acknowledge a restart before it is killed.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default restart signal.
pub const DEFAULT_RESTART_SIGNAL: Signal = Signal::User2;

const ENV_TERMINATE_TIMEOUT_SECS: &str = "OVERSEER_TERMINATE_TIMEOUT_SECS";
const ENV_RESTART_SIGNAL: &str = "OVERSEER_RESTART_SIGNAL";

/// The user program: called once per worker generation with that generation's [`State`].
pub type Program = Arc<dyn Fn(State) -> BoxFuture<'static, ()> + Send + Sync>;

/// Run-time configuration.
#[derive(Clone)]
pub struct Config {
    pub(crate) program: Program,
    /// Single listening address (set this or `addresses`, not both).
    pub address: Option<String>,
    /// Listening addresses, in the order the program will see its listeners.
    pub addresses: Vec<String>,
    /// Signal that triggers a graceful restart. Defaults to `SIGUSR2`.
    pub restart_signal: Option<Signal>,
    /// How long a generation gets to release its sockets before it is killed.
    pub terminate_timeout: Duration,
    /// Never fall back to running the program directly when startup fails.
    pub required: bool,
    /// Log every supervisor action.
    pub debug: bool,
    /// Silence warnings.
    pub no_warn: bool,
    /// Turn the restart signal into a shutdown signal.
    pub no_restart: bool,
    /// Close listeners as soon as a restart is requested, so only one generation accepts
    /// per address. By default the outgoing and incoming generations accept concurrently
    /// until the outgoing program stops accepting by itself.
    pub single_accept: bool,
}

impl Config {
    /// Create a configuration running `program` in every generation.
    pub fn new<F, Fut>(program: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            program: Arc::new(move |state| program(state).boxed()),
            address: None,
            addresses: Vec::new(),
            restart_signal: None,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            required: false,
            debug: false,
            no_warn: false,
            no_restart: false,
            single_accept: false,
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn restart_signal(mut self, signal: Signal) -> Self {
        self.restart_signal = Some(signal);
        self
    }

    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn no_warn(mut self, no_warn: bool) -> Self {
        self.no_warn = no_warn;
        self
    }

    pub fn no_restart(mut self, no_restart: bool) -> Self {
        self.no_restart = no_restart;
        self
    }

    pub fn single_accept(mut self, single_accept: bool) -> Self {
        self.single_accept = single_accept;
        self
    }

    /// Overlay settings from `OVERSEER_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TERMINATE_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.terminate_timeout = Duration::from_secs(secs),
                Err(e) => warn!(value = %raw, error = %e, "Ignoring {}", ENV_TERMINATE_TIMEOUT_SECS),
            }
        }

        if let Some(raw) = lookup(ENV_RESTART_SIGNAL) {
            match raw.parse::<Signal>() {
                Ok(signal) => self.restart_signal = Some(signal),
                Err(e) => warn!(value = %raw, error = %e, "Ignoring {}", ENV_RESTART_SIGNAL),
            }
        }

        self
    }

    /// Apply defaults and check invariants.
    ///
    /// After this, `addresses` holds at least one entry, `restart_signal` is set and the
    /// terminate timeout is positive.
    pub(crate) fn validated(mut self) -> Result<Self> {
        if let Some(address) = self.address.take() {
            if !self.addresses.is_empty() {
                return Err(Error::InvalidConfig(
                    "address and addresses can't both be set".to_string(),
                ));
            }
            self.addresses = vec![address];
        }
        if self.addresses.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one listening address is required".to_string(),
            ));
        }
        self.address = self.addresses.first().cloned();

        if self.restart_signal.is_none() {
            self.restart_signal = Some(DEFAULT_RESTART_SIGNAL);
        }
        if self.terminate_timeout.is_zero() {
            self.terminate_timeout = DEFAULT_TERMINATE_TIMEOUT;
        }

        Ok(self)
    }

    /// The restart signal, or the default when unset.
    pub fn resolved_restart_signal(&self) -> Signal {
        self.restart_signal.unwrap_or(DEFAULT_RESTART_SIGNAL)
    }

    /// Log the resolved configuration.
    pub fn log_config(&self) {
        debug!(addresses = ?self.addresses, "Listening addresses");
        debug!(
            restart_signal = %self.resolved_restart_signal(),
            terminate_timeout_secs = self.terminate_timeout.as_secs_f64(),
            "Restart handshake"
        );
        debug!(
            required = self.required,
            no_restart = self.no_restart,
            single_accept = self.single_accept,
            "Flags"
        );
    }

    /// Whether warnings should be emitted.
    pub(crate) fn warnings_enabled(&self) -> bool {
        self.debug || !self.no_warn
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("address", &self.address)
            .field("addresses", &self.addresses)
            .field("restart_signal", &self.restart_signal)
            .field("terminate_timeout", &self.terminate_timeout)
            .field("required", &self.required)
            .field("debug", &self.debug)
            .field("no_warn", &self.no_warn)
            .field("no_restart", &self.no_restart)
            .field("single_accept", &self.single_accept)
            .finish_non_exhaustive()
    }
}
