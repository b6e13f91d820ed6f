//! The worker side of the protocol, running inside every generation.

use std::sync::Arc;

use nix::sys::signal::kill;
use nix::unistd::{getppid, Pid};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::descriptor;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::listener::GracefulListener;
use crate::signal::{Signal, SignalTable};
use crate::state::State;

/// One generation: hosts the user program on inherited listeners.
pub struct Worker {
    config: Arc<Config>,
    identity: Identity,
    signals: SignalTable,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(config: Arc<Config>, identity: Identity, signals: SignalTable) -> Self {
        Self {
            config,
            identity,
            signals,
            shutdown: CancellationToken::new(),
        }
    }

    /// Adopt the inherited listeners and run the program once.
    ///
    /// Returns `0` when the program returns. The generation ends there; whatever the
    /// program left running is torn down with the process.
    pub async fn run(&self) -> Result<i32> {
        let span = info_span!("worker", generation = self.identity.worker_id);
        async move {
            let expected = self.config.addresses.len();
            if self.identity.num_fds != expected {
                return Err(Error::Identity(format!(
                    "supervisor passed {} descriptors for {} addresses",
                    self.identity.num_fds, expected
                )));
            }

            let listeners = descriptor::inherit(self.identity.num_fds)?;
            let watcher = self.watch_restart_signal(listeners.clone())?;

            let state = State::worker(
                self.identity.worker_id,
                listeners,
                self.config.addresses.clone(),
                self.shutdown.clone(),
                self.identity.bin_path.clone(),
            );

            debug!(listeners = state.listeners().len(), "Starting program");
            (self.config.program)(state).await;
            watcher.abort();

            info!("Program returned");
            Ok(0)
        }
        .instrument(span)
        .await
    }

    /// Ask the supervisor for a graceful restart of this generation.
    pub fn trigger_restart(&self) {
        let restart = self.signals.restart;
        let Some(sig) = restart.to_nix() else {
            return;
        };
        let supervisor = Pid::from_raw(self.identity.supervisor_pid);
        match kill(supervisor, sig) {
            Ok(()) => info!(signal = %restart, "Restart requested from supervisor"),
            Err(errno) => warn!(signal = %restart, error = %errno, "Failed to request restart"),
        }
    }

    fn watch_restart_signal(&self, listeners: Vec<GracefulListener>) -> Result<JoinHandle<()>> {
        let restart = self.signals.restart;
        let raw = restart
            .raw()
            .ok_or_else(|| Error::Signal(format!("{restart} does not exist on this platform")))?;
        let stream = signal(SignalKind::from_raw(raw))
            .map_err(|e| Error::Signal(format!("setting {restart} listener: {e}")))?;

        let release = Release {
            shutdown: self.shutdown.clone(),
            listeners,
            single_accept: self.config.single_accept,
            acknowledge: (!self.config.no_restart).then_some(self.signals.acknowledge),
            supervisor_pid: self.identity.supervisor_pid,
        };

        Ok(tokio::spawn(release.run(stream).in_current_span()))
    }
}

/// The release half of the restart handshake.
struct Release {
    shutdown: CancellationToken,
    listeners: Vec<GracefulListener>,
    single_accept: bool,
    /// `None` when restarts are disabled: the restart signal is then a plain shutdown
    /// request and the supervisor is not waiting for an answer.
    acknowledge: Option<Signal>,
    supervisor_pid: i32,
}

impl Release {
    async fn run(self, mut stream: SignalStream) {
        if stream.recv().await.is_none() {
            return;
        }

        info!("Restart signal received, stepping down");
        self.shutdown.cancel();

        if self.single_accept {
            for listener in &self.listeners {
                listener.close().await;
            }
        }

        if let Some(acknowledge) = self.acknowledge {
            self.send_acknowledgement(acknowledge);
        }

        while stream.recv().await.is_some() {
            debug!("Already stepping down");
        }
    }

    fn send_acknowledgement(&self, acknowledge: Signal) {
        let parent = getppid();
        if parent.as_raw() != self.supervisor_pid {
            warn!(
                parent = parent.as_raw(),
                supervisor = self.supervisor_pid,
                "Supervisor is gone, not acknowledging"
            );
            return;
        }
        let Some(sig) = acknowledge.to_nix() else {
            return;
        };
        match kill(parent, sig) {
            Ok(()) => debug!(signal = %acknowledge, "Released listeners"),
            Err(errno) => warn!(error = %errno, "Failed to acknowledge restart"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    fn identity(num_fds: usize) -> Identity {
        Identity {
            worker_id: 3,
            bin_path: PathBuf::from("/usr/bin/true"),
            num_fds,
            supervisor_pid: std::process::id() as i32,
        }
    }

    #[tokio::test]
    async fn test_descriptor_count_must_match_addresses() {
        let config = Config::new(|_| async {})
            .addresses(["127.0.0.1:0", "127.0.0.1:0"])
            .validated()
            .unwrap();
        let worker = Worker::new(
            Arc::new(config),
            identity(1),
            SignalTable::resolve(Signal::User2).unwrap(),
        );

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, Error::Identity(_)));
    }

    #[tokio::test]
    async fn test_single_accept_closes_listeners_on_release() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listener = GracefulListener::from_std(std_listener).unwrap();
        let shutdown = CancellationToken::new();

        // Hangup stands in for the restart signal so the test runner is not disturbed.
        let stream = signal(SignalKind::hangup()).unwrap();
        let release = Release {
            shutdown: shutdown.clone(),
            listeners: vec![listener.clone()],
            single_accept: true,
            acknowledge: None,
            supervisor_pid: std::process::id() as i32,
        };
        let task = tokio::spawn(release.run(stream));

        kill(Pid::this(), nix::sys::signal::Signal::SIGHUP).unwrap();
        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !listener.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        task.abort();
    }

    #[tokio::test]
    async fn test_release_keeps_listeners_open_for_the_replacement() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listener = GracefulListener::from_std(std_listener).unwrap();
        let addr = listener.local_addr();
        // What the next generation adopts: the same socket under another descriptor.
        let inherited = std::net::TcpListener::from(listener.inheritable_fd().unwrap());
        let replacement = GracefulListener::from_std(inherited).unwrap();
        let shutdown = CancellationToken::new();

        let stream = signal(SignalKind::window_change()).unwrap();
        let release = Release {
            shutdown: shutdown.clone(),
            listeners: vec![listener.clone()],
            single_accept: false,
            acknowledge: None,
            supervisor_pid: std::process::id() as i32,
        };
        let task = tokio::spawn(release.run(stream));

        kill(Pid::this(), nix::sys::signal::Signal::SIGWINCH).unwrap();
        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!listener.is_closed());

        // Both generations can accept on the shared socket.
        for holder in [&listener, &replacement] {
            let client = tokio::spawn(tokio::net::TcpStream::connect(addr));
            let accepted = tokio::time::timeout(Duration::from_secs(5), holder.accept())
                .await
                .unwrap();
            assert!(accepted.is_ok());
            client.await.unwrap().unwrap();
        }

        task.abort();
    }
}
