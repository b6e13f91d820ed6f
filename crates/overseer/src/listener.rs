//! Listening sockets that survive process replacement.

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keep-alive period applied to every accepted connection.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// A listening socket shared with other generations.
///
/// Cloning is cheap; all clones refer to the same socket. [`close`](Self::close) closes it
/// for every clone in this process, but never for other generations holding their own
/// duplicate of the descriptor.
#[derive(Clone)]
pub struct GracefulListener {
    inner: Arc<Inner>,
}

struct Inner {
    listener: RwLock<Option<TcpListener>>,
    closed: CancellationToken,
    local_addr: SocketAddr,
}

impl GracefulListener {
    /// Wrap a bound std listener. Must be called from within a Tokio runtime.
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;

        Ok(Self {
            inner: Arc::new(Inner {
                listener: RwLock::new(Some(listener)),
                closed: CancellationToken::new(),
                local_addr,
            }),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Accept a connection, enabling TCP keep-alive on it.
    ///
    /// Returns an error of kind [`io::ErrorKind::NotConnected`] once the listener is closed,
    /// including for accepts already pending when [`close`](Self::close) was called.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let guard = self.inner.listener.read().await;
        let listener = guard.as_ref().ok_or_else(closed_error)?;

        let (stream, peer) = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(closed_error()),
            accepted = listener.accept() => accepted?,
        };

        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
        let keepalive = keepalive.with_interval(KEEPALIVE_PERIOD);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        Ok((stream, peer))
    }

    /// Close the listener in this process.
    ///
    /// Wakes pending accepts, then drops the socket once they have returned. Connections
    /// already accepted are untouched.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        if self.inner.listener.write().await.take().is_some() {
            debug!(addr = %self.inner.local_addr, "Listener closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Duplicate the raw descriptor for inheritance by another process.
    ///
    /// The duplicate does not carry `FD_CLOEXEC`, so it survives `exec`.
    #[cfg(unix)]
    pub fn inheritable_fd(&self) -> io::Result<OwnedFd> {
        let guard = self
            .inner
            .listener
            .try_read()
            .map_err(|_| closed_error())?;
        let listener = guard.as_ref().ok_or_else(closed_error)?;
        crate::descriptor::dup_inheritable(listener.as_raw_fd())
    }
}

impl fmt::Debug for GracefulListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulListener")
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}
