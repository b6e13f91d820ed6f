//! The supervisor process.
//!
//! Binds the configured addresses once, then spawns worker generations one after another,
//! each inheriting duplicates of the listening descriptors. A signal relay runs alongside
//! the fork loop: it turns the restart signal into a restart handshake, resolves the
//! handshake when the worker acknowledges, and forwards everything else to the current
//! generation.
//!
//! A restart goes:
//!
//! 1. restart signal → sent on to the current generation, timeout watch starts;
//! 2. worker releases its claim on new connections → acknowledgement signal back;
//! 3. the fork loop stops waiting on the old generation and spawns the next one, which
//!    completes the handshake;
//! 4. the old generation drains on its own and exits, unobserved.
//!
//! If the acknowledgement never comes, the current generation is killed once the terminate
//! timeout elapses and its exit leads to the next spawn.

use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::Config;
use crate::descriptor::{remap_for_child, DescriptorSet};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::signal::{Signal, SignalTable};

/// Signals the relay listens for, in addition to the configured restart signal.
const RELAYED: [Signal; 7] = [
    Signal::Hangup,
    Signal::Interrupt,
    Signal::Quit,
    Signal::Terminate,
    Signal::User1,
    Signal::User2,
    Signal::Child,
];

/// One spawned worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    /// Monotonic sequence id, starting at 1.
    pub id: u64,
    pub pid: i32,
    pub started_at: Instant,
}

/// State of one restart attempt.
#[derive(Debug)]
struct RestartHandshake {
    /// Generation being replaced.
    generation: u64,
    started_at: Instant,
    awaiting_ack: bool,
    completion: oneshot::Sender<()>,
}

/// How each generation is started: the binary, and `argv` including `argv[0]`.
#[derive(Debug, Clone)]
struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
}

/// Whether an acknowledgement signal is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckState {
    None,
    /// The handshake in progress waits for it.
    Awaiting,
    /// The replaced generation exited before its acknowledgement was seen, and the
    /// signal may still be on its way.
    Late,
}

/// What the relay does with a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayAction {
    Restart,
    Ignore,
    Acknowledge,
    /// An acknowledgement from a generation already replaced.
    Stale,
    Forward(i32),
    Exit(i32),
    Discard,
}

/// Classify a received signal. Order matters: the first matching rule wins.
pub(crate) fn classify(
    signal: Signal,
    table: &SignalTable,
    ack: AckState,
    current: Option<i32>,
) -> RelayAction {
    if signal == table.restart {
        RelayAction::Restart
    } else if signal == Signal::Child {
        RelayAction::Ignore
    } else if signal == table.acknowledge && ack == AckState::Awaiting {
        RelayAction::Acknowledge
    } else if signal == table.acknowledge && ack == AckState::Late {
        RelayAction::Stale
    } else if let Some(pid) = current {
        RelayAction::Forward(pid)
    } else if signal.is_shutdown() {
        RelayAction::Exit(1)
    } else {
        RelayAction::Discard
    }
}

/// How a restart handshake ended, from the timeout watcher's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeOutcome {
    /// A replacement generation was spawned.
    Completed,
    /// The supervisor went away.
    Abandoned,
    /// The terminate timeout elapsed first.
    TimedOut,
}

pub(crate) async fn await_handshake(
    completion: oneshot::Receiver<()>,
    timeout: Duration,
) -> HandshakeOutcome {
    match tokio::time::timeout(timeout, completion).await {
        Ok(Ok(())) => HandshakeOutcome::Completed,
        Ok(Err(_)) => HandshakeOutcome::Abandoned,
        Err(_) => HandshakeOutcome::TimedOut,
    }
}

struct Shared {
    config: Arc<Config>,
    signals: SignalTable,
    next_id: AtomicU64,
    current: Mutex<Option<Generation>>,
    handshake: Mutex<Option<RestartHandshake>>,
    /// Always locked after `handshake`.
    late_ack: Mutex<bool>,
    /// Carries the id of the generation that released its descriptors.
    released: mpsc::UnboundedSender<u64>,
    exit: mpsc::UnboundedSender<i32>,
}

struct LoopChannels {
    released: mpsc::UnboundedReceiver<u64>,
    exit: mpsc::UnboundedReceiver<i32>,
}

/// The supervisor half of the protocol.
pub struct Supervisor {
    shared: Arc<Shared>,
    channels: Mutex<Option<LoopChannels>>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, signals: SignalTable) -> Self {
        let (released_tx, released_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                config,
                signals,
                next_id: AtomicU64::new(0),
                current: Mutex::new(None),
                handshake: Mutex::new(None),
                late_ack: Mutex::new(false),
                released: released_tx,
                exit: exit_tx,
            }),
            channels: Mutex::new(Some(LoopChannels {
                released: released_rx,
                exit: exit_rx,
            })),
        }
    }

    /// Run until the supervised program exits for good.
    ///
    /// Returns the exit code the supervisor process should exit with. Errors before the
    /// first spawn are startup errors; a spawn failure later is fatal.
    pub async fn run(&self) -> Result<i32> {
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::InvalidConfig("supervisor is already running".to_string()))?;

        let span = info_span!("supervisor", pid = std::process::id());
        async move {
            let launch = Launch {
                program: resolve_binary()?,
                args: std::env::args_os().collect(),
            };
            debug!(bin = %launch.program.display(), "Resolved binary path");

            self.install_relay()?;
            let descriptors = DescriptorSet::bind(&self.shared.config.addresses)?;

            self.fork_loop(&launch, &descriptors, channels).await
        }
        .instrument(span)
        .await
    }

    /// Start a graceful restart of the current generation.
    ///
    /// No-op while a restart is already in progress or when no generation is running.
    pub fn trigger_restart(&self) {
        self.shared.trigger_restart();
    }

    /// The generation the supervisor currently considers active.
    pub fn current_generation(&self) -> Option<Generation> {
        *self.shared.current()
    }

    fn install_relay(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut relayed = RELAYED.to_vec();
        if !relayed.contains(&self.shared.signals.restart) {
            relayed.push(self.shared.signals.restart);
        }

        for sig in relayed {
            let raw = sig
                .raw()
                .ok_or_else(|| Error::Signal(format!("{sig} does not exist on this platform")))?;
            trace!(signal = %sig, "Listening for unix signal");
            let mut stream = signal(SignalKind::from_raw(raw))
                .map_err(|e| Error::Signal(format!("setting {sig} listener: {e}")))?;

            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(sig).is_err() {
                        break;
                    }
                }
            });
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(
            async move {
                while let Some(sig) = rx.recv().await {
                    shared.handle_signal(sig);
                }
            }
            .in_current_span(),
        );

        Ok(())
    }

    async fn fork_loop(
        &self,
        launch: &Launch,
        descriptors: &DescriptorSet,
        mut channels: LoopChannels,
    ) -> Result<i32> {
        loop {
            if let Ok(code) = channels.exit.try_recv() {
                return Ok(code);
            }

            let (mut child, generation) = self.fork(launch, descriptors)?;
            if let Some(code) = self.wait(&mut child, generation, &mut channels).await? {
                return Ok(code);
            }
        }
    }

    /// Wait until `generation` exits or releases its descriptors.
    ///
    /// Returns the code to exit with, or `None` when the next generation should start.
    async fn wait(
        &self,
        child: &mut Child,
        generation: Generation,
        channels: &mut LoopChannels,
    ) -> Result<Option<i32>> {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = exit_code(status?);
                    self.shared.clear_current(generation.id);
                    let uptime_ms = generation.started_at.elapsed().as_millis() as u64;

                    if self.shared.config.no_restart || !self.shared.restart_in_progress() {
                        info!(generation = generation.id, code, uptime_ms, "Program exited");
                        return Ok(Some(code));
                    }
                    debug!(
                        generation = generation.id,
                        code,
                        uptime_ms,
                        "Program exited during restart"
                    );
                    return Ok(None);
                }
                Some(released) = channels.released.recv() => {
                    if released == generation.id {
                        debug!(
                            generation = generation.id,
                            "Descriptors released, starting replacement"
                        );
                        return Ok(None);
                    }
                    debug!(
                        generation = generation.id,
                        released,
                        "Ignoring release from a replaced generation"
                    );
                }
                Some(code) = channels.exit.recv() => {
                    return Ok(Some(code));
                }
            }
        }
    }

    fn fork(&self, launch: &Launch, descriptors: &DescriptorSet) -> Result<(Child, Generation)> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let identity = Identity {
            worker_id: id,
            bin_path: launch.program.clone(),
            num_fds: descriptors.len(),
            supervisor_pid: std::process::id() as i32,
        };
        debug!(generation = id, bin = %launch.program.display(), "Starting generation");

        let mut command = Command::new(&launch.program);
        let mut args = launch.args.iter();
        if let Some(arg0) = args.next() {
            command.arg0(arg0);
        }
        command
            .args(args)
            .envs(identity.to_env())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let sources = descriptors.raw_fds();
        // SAFETY: remap_for_child only calls async-signal-safe functions and does not
        // allocate.
        unsafe {
            command.pre_exec(move || remap_for_child(&sources));
        }

        let child = command.spawn().map_err(Error::Spawn)?;
        let pid = child.id().ok_or_else(|| {
            Error::Spawn(io::Error::new(
                io::ErrorKind::Other,
                "generation exited before it could be tracked",
            ))
        })? as i32;

        let generation = Generation {
            id,
            pid,
            started_at: Instant::now(),
        };
        *self.shared.current() = Some(generation);
        info!(generation = id, pid, "Generation started");

        if let Some(handshake) = self.shared.complete_handshake() {
            info!(
                generation = id,
                replaced = handshake.generation,
                elapsed_ms = handshake.started_at.elapsed().as_millis() as u64,
                "Restart complete"
            );
            let _ = handshake.completion.send(());
        }

        Ok((child, generation))
    }
}

impl Shared {
    fn current(&self) -> MutexGuard<'_, Option<Generation>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handshake(&self) -> MutexGuard<'_, Option<RestartHandshake>> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn late_ack(&self) -> MutexGuard<'_, bool> {
        self.late_ack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn restart_in_progress(&self) -> bool {
        self.handshake().is_some()
    }

    /// Take the handshake once its replacement generation is running.
    ///
    /// If the replaced generation never got its acknowledgement through, that signal may
    /// still arrive and must not reach the new generation.
    fn complete_handshake(&self) -> Option<RestartHandshake> {
        let mut handshake = self.handshake();
        let taken = handshake.take()?;
        *self.late_ack() = taken.awaiting_ack;
        Some(taken)
    }

    fn ack_state(&self) -> AckState {
        let handshake = self.handshake();
        if handshake.as_ref().is_some_and(|h| h.awaiting_ack) {
            AckState::Awaiting
        } else if *self.late_ack() {
            AckState::Late
        } else {
            AckState::None
        }
    }

    fn clear_current(&self, id: u64) {
        let mut current = self.current();
        if current.is_some_and(|generation| generation.id == id) {
            *current = None;
        }
    }

    fn handle_signal(self: &Arc<Self>, sig: Signal) {
        let ack = self.ack_state();
        let current = self.current().map(|generation| generation.pid);

        match classify(sig, &self.signals, ack, current) {
            RelayAction::Restart => self.trigger_restart(),
            RelayAction::Ignore => {}
            RelayAction::Acknowledge => self.acknowledge(),
            RelayAction::Stale => {
                *self.late_ack() = false;
                debug!(signal = %sig, "Late acknowledgement from a replaced generation");
            }
            RelayAction::Forward(pid) => {
                debug!(signal = %sig, pid, "Forwarding signal");
                self.send_signal(pid, sig);
            }
            RelayAction::Exit(code) => {
                debug!(signal = %sig, "Interrupted with no generation running");
                let _ = self.exit.send(code);
            }
            RelayAction::Discard => {
                debug!(signal = %sig, "Signal discarded, no generation running");
            }
        }
    }

    fn acknowledge(&self) {
        let mut handshake = self.handshake();
        if let Some(handshake) = handshake.as_mut().filter(|h| h.awaiting_ack) {
            handshake.awaiting_ack = false;
            debug!(
                generation = handshake.generation,
                elapsed_ms = handshake.started_at.elapsed().as_millis() as u64,
                "Sockets released"
            );
            let _ = self.released.send(handshake.generation);
        }
    }

    /// Start a handshake unless one is already running or nothing is running.
    fn begin_handshake(&self) -> Option<(i32, oneshot::Receiver<()>)> {
        let mut handshake = self.handshake();
        if handshake.is_some() {
            debug!("Already restarting");
            return None;
        }
        let Some(generation) = *self.current() else {
            debug!("No generation running, nothing to restart");
            return None;
        };

        let (completion, completed) = oneshot::channel();
        *self.late_ack() = false;
        *handshake = Some(RestartHandshake {
            generation: generation.id,
            started_at: Instant::now(),
            awaiting_ack: !self.config.no_restart,
            completion,
        });
        Some((generation.pid, completed))
    }

    fn trigger_restart(self: &Arc<Self>) {
        let Some((pid, completed)) = self.begin_handshake() else {
            return;
        };

        info!(pid, signal = %self.signals.restart, "Graceful restart triggered");
        self.send_signal(pid, self.signals.restart);

        let shared = Arc::clone(self);
        let timeout = self.config.terminate_timeout;
        tokio::spawn(
            async move {
                match await_handshake(completed, timeout).await {
                    HandshakeOutcome::Completed => {}
                    HandshakeOutcome::Abandoned => debug!("Restart handshake abandoned"),
                    HandshakeOutcome::TimedOut => {
                        warn!(
                            timeout_secs = timeout.as_secs_f64(),
                            "Graceful timeout, forcing exit"
                        );
                        shared.force_kill();
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn force_kill(&self) {
        if let Some(handshake) = self.handshake().as_mut() {
            handshake.awaiting_ack = false;
        }
        let current = *self.current();
        if let Some(generation) = current {
            self.send_signal(generation.pid, self.signals.terminate);
        }
    }

    /// Deliver a signal to a generation presumed alive.
    ///
    /// Failure means the generation is gone without the supervisor noticing; the supervisor
    /// then exits with status 1.
    fn send_signal(&self, pid: i32, sig: Signal) {
        let Some(nix_sig) = sig.to_nix() else {
            debug!(signal = %sig, "Signal does not exist on this platform, not sending");
            return;
        };

        if let Err(errno) = kill(Pid::from_raw(pid), nix_sig) {
            error!(
                pid,
                signal = %sig,
                error = %errno,
                "Signal failed, assuming generation died unexpectedly"
            );
            let _ = self.exit.send(1);
        }
    }
}

/// Exit code to propagate: the program's own code, or `128 + signal` if it was killed.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Absolute path of the binary to re-execute.
///
/// Prefers `argv[0]` when it names a path, so that a binary replaced on disk is picked up
/// by the next generation.
fn resolve_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(Error::BinaryPath)?;

    let Some(arg0) = std::env::args_os().next().map(PathBuf::from) else {
        return Ok(exe);
    };
    if arg0.components().count() < 2 {
        return Ok(exe);
    }
    if arg0.is_absolute() {
        return Ok(arg0);
    }
    let cwd = std::env::current_dir().map_err(Error::BinaryPath)?;
    Ok(cwd.join(arg0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SignalTable {
        SignalTable::resolve(Signal::User2).unwrap()
    }

    fn supervisor(config: Config) -> Supervisor {
        let config = config.address("127.0.0.1:0").validated().unwrap();
        Supervisor::new(Arc::new(config), table())
    }

    fn fake_generation(pid: i32) -> Generation {
        Generation {
            id: 1,
            pid,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn test_classify_rules_in_order() {
        let table = table();
        let none = AckState::None;

        assert_eq!(
            classify(Signal::User2, &table, AckState::Awaiting, Some(10)),
            RelayAction::Restart
        );
        assert_eq!(classify(Signal::Child, &table, none, Some(10)), RelayAction::Ignore);
        assert_eq!(
            classify(Signal::User1, &table, AckState::Awaiting, Some(10)),
            RelayAction::Acknowledge
        );
        assert_eq!(
            classify(Signal::User1, &table, AckState::Late, Some(10)),
            RelayAction::Stale
        );
        assert_eq!(
            classify(Signal::User1, &table, none, Some(10)),
            RelayAction::Forward(10)
        );
        assert_eq!(
            classify(Signal::Hangup, &table, AckState::Late, Some(10)),
            RelayAction::Forward(10)
        );
        assert_eq!(classify(Signal::Interrupt, &table, none, None), RelayAction::Exit(1));
        assert_eq!(classify(Signal::Terminate, &table, none, None), RelayAction::Exit(1));
        assert_eq!(classify(Signal::Hangup, &table, none, None), RelayAction::Discard);
    }

    #[test]
    fn test_custom_restart_signal_takes_precedence() {
        let table = SignalTable::resolve(Signal::Hangup).unwrap();
        let none = AckState::None;
        assert_eq!(classify(Signal::Hangup, &table, none, Some(10)), RelayAction::Restart);
        assert_eq!(
            classify(Signal::User2, &table, none, Some(10)),
            RelayAction::Forward(10)
        );
    }

    #[tokio::test]
    async fn test_begin_handshake_is_idempotent() {
        let supervisor = supervisor(Config::new(|_| async {}));
        let shared = &supervisor.shared;

        assert!(shared.begin_handshake().is_none(), "no generation running");

        *shared.current() = Some(fake_generation(4242));
        let first = shared.begin_handshake();
        assert_eq!(first.as_ref().map(|(pid, _)| *pid), Some(4242));
        assert!(shared.restart_in_progress());
        assert!(shared.begin_handshake().is_none(), "already restarting");
    }

    #[tokio::test]
    async fn test_acknowledgement_releases_once() {
        let supervisor = supervisor(Config::new(|_| async {}));
        let mut channels = supervisor.channels.lock().unwrap().take().unwrap();
        let shared = &supervisor.shared;

        *shared.current() = Some(fake_generation(4242));
        let (_pid, _completed) = shared.begin_handshake().unwrap();
        shared.clear_current(1);

        shared.handle_signal(Signal::User1);
        assert_eq!(channels.released.try_recv(), Ok(1));

        // No longer awaiting, nothing running: discarded.
        shared.handle_signal(Signal::User1);
        assert!(channels.released.try_recv().is_err());
        assert!(channels.exit.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_acknowledgement_after_replacement_is_not_forwarded() {
        let supervisor = supervisor(Config::new(|_| async {}));
        let mut channels = supervisor.channels.lock().unwrap().take().unwrap();
        let shared = &supervisor.shared;

        *shared.current() = Some(fake_generation(4242));
        let (_pid, _completed) = shared.begin_handshake().unwrap();
        shared.clear_current(1);

        // The replacement is running before the old generation's acknowledgement lands.
        let mut replacement = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        let pid = replacement.id().unwrap() as i32;
        *shared.current() = Some(Generation {
            id: 2,
            pid,
            started_at: Instant::now(),
        });
        assert!(shared.complete_handshake().is_some());
        assert_eq!(shared.ack_state(), AckState::Late);

        shared.handle_signal(Signal::User1);
        assert!(channels.released.try_recv().is_err());
        assert!(channels.exit.try_recv().is_err());
        assert_eq!(shared.ack_state(), AckState::None);
        assert!(replacement.try_wait().unwrap().is_none());

        // Only one is swallowed.
        shared.handle_signal(Signal::User1);
        let status = replacement.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGUSR1));
    }

    /// A generation that acknowledges and exits at once must be replaced exactly once.
    #[tokio::test]
    async fn test_acknowledge_then_exit_spawns_one_replacement() {
        let supervisor = supervisor(Config::new(|_| async {}));
        let channels = supervisor.channels.lock().unwrap().take().unwrap();
        let shared = Arc::clone(&supervisor.shared);

        // Stands in for the relay; nothing else in this binary raises USR1.
        let mut acks = signal(SignalKind::user_defined1()).unwrap();
        let relay = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while acks.recv().await.is_some() {
                    shared.handle_signal(Signal::User1);
                }
            })
        };

        let launch = Launch {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "sh".into(),
                "-c".into(),
                "trap 'kill -USR1 $PPID; exit 0' USR2; while :; do sleep 0.05; done".into(),
            ],
        };
        let descriptors = DescriptorSet::bind(&["127.0.0.1:0".to_string()]).unwrap();
        let running = tokio::spawn(async move {
            supervisor.fork_loop(&launch, &descriptors, channels).await
        });

        let current = |shared: &Shared| *shared.current();
        tokio::time::timeout(Duration::from_secs(5), async {
            while current(&shared).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        shared.trigger_restart();
        tokio::time::timeout(Duration::from_secs(5), async {
            while current(&shared).map(|g| g.id) != Some(2) || shared.restart_in_progress() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Whichever order the acknowledgement and the exit arrive in, no third generation.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(shared.next_id.load(Ordering::SeqCst), 2);
        let second = current(&shared).unwrap();
        assert_eq!(second.id, 2);

        kill(Pid::from_raw(second.pid), nix::sys::signal::Signal::SIGKILL).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
        assert_eq!(shared.next_id.load(Ordering::SeqCst), 2);
        relay.abort();
    }

    #[tokio::test]
    async fn test_no_restart_never_awaits_acknowledgement() {
        let supervisor = supervisor(Config::new(|_| async {}).no_restart(true));
        let mut channels = supervisor.channels.lock().unwrap().take().unwrap();
        let shared = &supervisor.shared;

        *shared.current() = Some(fake_generation(4242));
        let (_pid, _completed) = shared.begin_handshake().unwrap();
        shared.clear_current(1);

        shared.handle_signal(Signal::User1);
        assert!(channels.released.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_interrupt_without_generation_exits_nonzero() {
        let supervisor = supervisor(Config::new(|_| async {}));
        let mut channels = supervisor.channels.lock().unwrap().take().unwrap();

        supervisor.shared.handle_signal(Signal::Interrupt);
        assert_eq!(channels.exit.try_recv(), Ok(1));
    }

    #[tokio::test]
    async fn test_signals_are_forwarded_verbatim() {
        let supervisor = supervisor(Config::new(|_| async {}));
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        *supervisor.shared.current() = Some(fake_generation(pid));

        supervisor.shared.handle_signal(Signal::Hangup);

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGHUP));
        assert_eq!(exit_code(status), 128 + libc::SIGHUP);
    }

    #[tokio::test]
    async fn test_failed_delivery_exits_nonzero() {
        let supervisor = supervisor(Config::new(|_| async {}));
        let mut channels = supervisor.channels.lock().unwrap().take().unwrap();

        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        child.wait().await.unwrap();
        *supervisor.shared.current() = Some(fake_generation(pid));

        supervisor.shared.handle_signal(Signal::Hangup);
        assert_eq!(channels.exit.try_recv(), Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_kill_not_before_timeout() {
        let (_completion, completed) = oneshot::channel::<()>();
        let started = tokio::time::Instant::now();

        let outcome = await_handshake(completed, Duration::from_secs(30)).await;

        assert_eq!(outcome, HandshakeOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_wins_over_timeout() {
        let (completion, completed) = oneshot::channel();
        let watcher = tokio::spawn(await_handshake(completed, Duration::from_secs(30)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        completion.send(()).unwrap();

        assert_eq!(watcher.await.unwrap(), HandshakeOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unacknowledged_restart_escalates_to_kill() {
        let supervisor = supervisor(
            Config::new(|_| async {}).terminate_timeout(Duration::from_millis(200)),
        );

        // Ignores the restart signal and never acknowledges.
        let mut child = Command::new("sh")
            .args(["-c", "trap '' USR2; exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;
        *supervisor.shared.current() = Some(fake_generation(pid));
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        supervisor.trigger_restart();
        supervisor.trigger_restart();

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(supervisor.shared.restart_in_progress());
    }
}
