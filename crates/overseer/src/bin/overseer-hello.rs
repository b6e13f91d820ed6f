//! Minimal HTTP server running under overseer.
//!
//! Answers every request with `app#<generation> says hello`, after sleeping for the number
//! of milliseconds given as `?d=<millis>`. Send `SIGUSR2` to the supervisor to restart it.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use overseer::{Config, GracefulListener, State};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const MAX_REQUEST_HEAD: usize = 8 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "overseer-hello")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on; repeat for several listeners
    #[arg(long = "addr", default_value = ":5001")]
    addrs: Vec<String>,

    /// Treat the restart signal as a shutdown request
    #[arg(long)]
    no_restart: bool,

    /// Stop accepting on every listener as soon as a restart is requested
    #[arg(long)]
    single_accept: bool,

    /// Fail instead of running without overseer
    #[arg(long)]
    required: bool,

    /// Log every supervisor action
    #[arg(long)]
    debug: bool,

    /// Terminate timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Exit with `--exit-code` this long after starting
    #[arg(long)]
    exit_after_ms: Option<u64>,

    #[arg(long, default_value_t = 0)]
    exit_code: i32,

    /// Have the first generation request its own replacement this long after starting
    #[arg(long)]
    restart_after_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let program_cli = cli.clone();
    let mut config = Config::new(move |state| serve(state, program_cli.clone()))
        .addresses(cli.addrs.iter().cloned())
        .no_restart(cli.no_restart)
        .single_accept(cli.single_accept)
        .required(cli.required)
        .debug(cli.debug)
        .with_env_overrides();
    if let Some(ms) = cli.timeout_ms {
        config = config.terminate_timeout(Duration::from_millis(ms));
    }

    overseer::run(config).await;
    Ok(())
}

async fn serve(state: State, cli: Cli) {
    if !state.enabled() {
        println!("running without overseer");
        return;
    }

    let id = state.id().to_string();
    let addrs: Vec<String> = state
        .listeners()
        .iter()
        .map(|listener| listener.local_addr().to_string())
        .collect();
    println!("app#{id} listening on {}", addrs.join(" "));

    if let Some(ms) = cli.exit_after_ms {
        let code = cli.exit_code;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            std::process::exit(code);
        });
    }
    if let Some(ms) = cli.restart_after_ms.filter(|_| id == "1") {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            overseer::restart();
        });
    }

    let mut accept_loops = JoinSet::new();
    for listener in state.listeners() {
        accept_loops.spawn(accept_loop(listener.clone(), state.clone()));
    }
    while accept_loops.join_next().await.is_some() {}

    println!("app#{id} exiting");
}

/// Accept until told to step down, then wait for in-flight requests.
async fn accept_loop(listener: GracefulListener, state: State) {
    let shutdown = state.graceful_shutdown().clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    let id = state.id().to_string();
                    connections.spawn(async move {
                        if let Err(e) = respond(stream, &id).await {
                            warn!(error = %e, "Request failed");
                        }
                    });
                }
                Err(e) if listener.is_closed() => {
                    debug!(error = %e, "Listener closed");
                    break;
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn respond(mut stream: TcpStream, id: &str) -> Result<()> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
        let n = stream.read(&mut buf).await.context("reading request")?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }

    let delay = requested_delay(&String::from_utf8_lossy(&head));
    tokio::time::sleep(delay).await;

    let body = format!("app#{id} says hello\n");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .context("writing response")?;
    stream.shutdown().await.context("closing connection")?;
    Ok(())
}

/// The `d` query parameter of the request line, in milliseconds.
fn requested_delay(head: &str) -> Duration {
    let target = head.split_whitespace().nth(1).unwrap_or("/");
    let query = target.split_once('?').map_or("", |(_, query)| query);
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("d="))
        .and_then(|millis| millis.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_default()
}
