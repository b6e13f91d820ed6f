//! Logical signals exchanged between the supervisor and its worker generations.
//!
//! Three signals carry the protocol:
//!
//! - the **restart** signal (configurable, `SIGUSR2` by default) asks the current
//!   generation to release its claim on new connections;
//! - the **acknowledge** signal (`SIGUSR1`) is sent back by the worker once it has done so;
//! - the **terminate** signal (`SIGKILL`) is the forced-kill fallback when the worker never
//!   acknowledges within the terminate timeout.
//!
//! Every other interrupt/terminate-class signal the supervisor receives is forwarded verbatim
//! to the active generation.

use std::fmt;
use std::str::FromStr;

#[cfg(unix)]
use nix::sys::signal::Signal as NixSignal;

use crate::error::{Error, Result};

/// A signal, named independently of the platform's numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// `SIGHUP`.
    Hangup,
    /// `SIGINT`.
    Interrupt,
    /// `SIGQUIT`.
    Quit,
    /// `SIGTERM`.
    Terminate,
    /// `SIGKILL`. Cannot be caught; only ever sent.
    ForceStop,
    /// `SIGUSR1`. Reserved for the acknowledgement.
    User1,
    /// `SIGUSR2`. The default restart signal.
    User2,
    /// `SIGCHLD`, delivered whenever a generation exits.
    Child,
    /// Any other raw signal number.
    Custom(i32),
}

impl Signal {
    /// Converts to a [`nix`] signal, if valid on this platform.
    #[cfg(unix)]
    #[must_use]
    pub fn to_nix(self) -> Option<NixSignal> {
        match self {
            Self::Hangup => Some(NixSignal::SIGHUP),
            Self::Interrupt => Some(NixSignal::SIGINT),
            Self::Quit => Some(NixSignal::SIGQUIT),
            Self::Terminate => Some(NixSignal::SIGTERM),
            Self::ForceStop => Some(NixSignal::SIGKILL),
            Self::User1 => Some(NixSignal::SIGUSR1),
            Self::User2 => Some(NixSignal::SIGUSR2),
            Self::Child => Some(NixSignal::SIGCHLD),
            Self::Custom(raw) => NixSignal::try_from(raw).ok(),
        }
    }

    /// Converts from a [`nix`] signal.
    #[cfg(unix)]
    #[must_use]
    pub fn from_nix(sig: NixSignal) -> Self {
        match sig {
            NixSignal::SIGHUP => Self::Hangup,
            NixSignal::SIGINT => Self::Interrupt,
            NixSignal::SIGQUIT => Self::Quit,
            NixSignal::SIGTERM => Self::Terminate,
            NixSignal::SIGKILL => Self::ForceStop,
            NixSignal::SIGUSR1 => Self::User1,
            NixSignal::SIGUSR2 => Self::User2,
            NixSignal::SIGCHLD => Self::Child,
            sig => Self::Custom(sig as i32),
        }
    }

    /// Raw platform number, if the signal exists here.
    #[cfg(unix)]
    pub(crate) fn raw(self) -> Option<i32> {
        self.to_nix().map(|sig| sig as i32)
    }

    /// Whether this signal asks the process to stop (`SIGINT` or `SIGTERM`).
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        matches!(self, Self::Interrupt | Self::Terminate)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hangup => write!(f, "SIGHUP"),
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Quit => write!(f, "SIGQUIT"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::ForceStop => write!(f, "SIGKILL"),
            Self::User1 => write!(f, "SIGUSR1"),
            Self::User2 => write!(f, "SIGUSR2"),
            Self::Child => write!(f, "SIGCHLD"),
            Self::Custom(raw) => write!(f, "signal {raw}"),
        }
    }
}

impl FromStr for Signal {
    type Err = Error;

    /// Parses `USR2`, `SIGUSR2`, `usr2` or a raw number like `12`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(raw) = trimmed.parse::<i32>() {
            return Self::from_raw(raw);
        }

        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "HUP" => Ok(Self::Hangup),
            "INT" => Ok(Self::Interrupt),
            "QUIT" => Ok(Self::Quit),
            "TERM" => Ok(Self::Terminate),
            "KILL" => Ok(Self::ForceStop),
            "USR1" => Ok(Self::User1),
            "USR2" => Ok(Self::User2),
            "CHLD" => Ok(Self::Child),
            other => Self::from_platform_name(other)
                .ok_or_else(|| Error::Signal(format!("unknown signal name: {s}"))),
        }
    }
}

impl Signal {
    #[cfg(unix)]
    fn from_raw(raw: i32) -> Result<Self> {
        NixSignal::try_from(raw)
            .map(Self::from_nix)
            .map_err(|_| Error::Signal(format!("invalid signal number: {raw}")))
    }

    #[cfg(not(unix))]
    fn from_raw(raw: i32) -> Result<Self> {
        Ok(Self::Custom(raw))
    }

    #[cfg(unix)]
    fn from_platform_name(name: &str) -> Option<Self> {
        NixSignal::from_str(&format!("SIG{name}"))
            .ok()
            .map(Self::from_nix)
    }

    #[cfg(not(unix))]
    fn from_platform_name(_name: &str) -> Option<Self> {
        None
    }
}

/// Whether descriptor inheritance and the signal handshake work on this platform.
#[must_use]
pub const fn is_supported() -> bool {
    cfg!(unix)
}

/// The logical signals of the protocol, resolved once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalTable {
    pub restart: Signal,
    pub acknowledge: Signal,
    pub terminate: Signal,
}

impl SignalTable {
    /// Resolve the table for the configured restart signal.
    ///
    /// Fails with [`Error::Unsupported`] off Unix, and rejects restart signals that would
    /// collide with the protocol or cannot be caught.
    pub fn resolve(restart: Signal) -> Result<Self> {
        if !is_supported() {
            return Err(Error::Unsupported(std::env::consts::OS));
        }

        #[cfg(unix)]
        let restart = match restart.to_nix() {
            None => {
                return Err(Error::Signal(format!(
                    "{restart} does not exist on this platform"
                )))
            }
            Some(NixSignal::SIGKILL | NixSignal::SIGSTOP) => {
                return Err(Error::Signal(format!("{restart} cannot be caught")))
            }
            Some(NixSignal::SIGCHLD | NixSignal::SIGUSR1) => {
                return Err(Error::Signal(format!(
                    "{restart} is reserved by the restart protocol"
                )))
            }
            // A raw number must compare equal to its named variant in the relay.
            Some(sig) => Signal::from_nix(sig),
        };

        Ok(Self {
            restart,
            acknowledge: Signal::User1,
            terminate: Signal::ForceStop,
        })
    }
}
