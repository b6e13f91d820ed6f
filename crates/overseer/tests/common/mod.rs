//! Shared harness: runs `overseer-hello` as a supervisor and watches its output.

#![allow(dead_code)]

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Once;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(15);

static INIT: Once = Once::new();

/// Initialize tracing once per test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("overseer=debug")
            .with_test_writer()
            .try_init();
    });
}

/// A running supervisor and everything its generations printed.
pub struct Supervised {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
    seen: Vec<String>,
}

impl Supervised {
    pub fn spawn(args: &[&str]) -> Self {
        init_tracing();

        let mut child = Command::new(env!("CARGO_BIN_EXE_overseer-hello"))
            .args(args)
            .env("RUST_LOG", "overseer=debug")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to start overseer-hello");

        let stdout = child.stdout.take().expect("stdout is piped");
        let (tx, lines) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(%line, "overseer-hello");
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Self {
            child,
            lines,
            seen: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id().expect("supervisor still running") as i32)
    }

    pub fn signal(&self, signal: Signal) {
        kill(self.pid(), signal).expect("failed to signal supervisor");
    }

    /// Wait for an output line containing `needle` and return it.
    pub async fn wait_for_line(&mut self, needle: &str) -> String {
        if let Some(line) = self.seen.iter().find(|line| line.contains(needle)) {
            return line.clone();
        }

        let found = tokio::time::timeout(WAIT, async {
            while let Some(line) = self.lines.recv().await {
                self.seen.push(line.clone());
                if line.contains(needle) {
                    return Some(line);
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(line)) => line,
            Ok(None) => panic!("output ended before {needle:?}; saw {:?}", self.seen),
            Err(_) => panic!("timed out waiting for {needle:?}; saw {:?}", self.seen),
        }
    }

    /// Whether any line seen so far contains `needle`.
    pub fn saw(&mut self, needle: &str) -> bool {
        while let Ok(line) = self.lines.try_recv() {
            self.seen.push(line);
        }
        self.seen.iter().any(|line| line.contains(needle))
    }

    /// Wait for the supervisor to exit and return its exit code.
    pub async fn exit_code(&mut self) -> i32 {
        let status = tokio::time::timeout(WAIT, self.child.wait())
            .await
            .expect("supervisor did not exit")
            .expect("failed to wait for supervisor");
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("no free port")
}

/// `GET /?d=<delay_ms>` and return the response body.
pub async fn hello(port: u16, delay_ms: u64) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("failed to connect");
    let request = format!("GET /?d={delay_ms} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("failed to send request");

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("failed to read response");
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.trim().to_string())
        .unwrap_or(response)
}
