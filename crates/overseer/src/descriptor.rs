//! Raw descriptor plumbing.
//!
//! The supervisor binds every configured address once into a [`DescriptorSet`] and lends
//! duplicates of those descriptors to each worker generation at fds `3..3+N`. Workers adopt
//! the inherited descriptors as [`GracefulListener`]s.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::info;

use crate::error::{Error, Result};
use crate::listener::GracefulListener;

/// First descriptor number used for inherited listeners.
pub const FIRST_INHERITED_FD: RawFd = 3;

const LISTEN_BACKLOG: i32 = 1024;

/// The listening descriptors owned by the supervisor for its whole lifetime.
///
/// Entry *i* is the socket bound to configured address *i*. Every descriptor is kept above
/// the inheritance range `3..3+N` so handing them to a child never clobbers one another.
#[derive(Debug)]
pub struct DescriptorSet {
    entries: Vec<(String, OwnedFd)>,
}

impl DescriptorSet {
    /// Bind every address exactly once.
    pub fn bind(addresses: &[String]) -> Result<Self> {
        let floor = FIRST_INHERITED_FD + addresses.len() as RawFd;
        let mut entries = Vec::with_capacity(addresses.len());

        for address in addresses {
            let fd = bind_above(address, floor)?;
            info!(addr = %address, fd = fd.as_raw_fd(), "Bound listening socket");
            entries.push((address.clone(), fd));
        }

        Ok(Self { entries })
    }

    /// Number of descriptors (equal to the number of configured addresses).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Addresses in configured order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(addr, _)| addr.as_str())
    }

    /// Raw descriptors in configured order, for remapping in a child.
    pub(crate) fn raw_fds(&self) -> Vec<RawFd> {
        self.entries.iter().map(|(_, fd)| fd.as_raw_fd()).collect()
    }
}

/// Resolve a configured address, treating a bare `:port` as every IPv4 interface.
pub(crate) fn resolve_address(address: &str) -> Result<SocketAddr> {
    let normalized = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };

    normalized
        .to_socket_addrs()
        .and_then(|mut addrs| {
            addrs.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
            })
        })
        .map_err(|source| Error::InvalidAddress {
            addr: address.to_string(),
            source,
        })
}

/// Bind one address and move its descriptor to `floor` or above.
fn bind_above(address: &str, floor: RawFd) -> Result<OwnedFd> {
    let addr = resolve_address(address)?;
    bind_socket(addr)
        .and_then(|fd| lift_above(fd, floor))
        .map_err(|source| Error::Bind {
            addr: address.to_string(),
            source,
        })
}

fn bind_socket(addr: SocketAddr) -> io::Result<OwnedFd> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Move a descriptor to a number `>= floor`, keeping `FD_CLOEXEC` set.
fn lift_above(fd: OwnedFd, floor: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fcntl on a descriptor we own; the result is checked below.
    let lifted = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if lifted < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `lifted` is a fresh descriptor returned by fcntl and owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(lifted) })
}

/// `dup(2)` never sets `FD_CLOEXEC` on the new descriptor.
pub(crate) fn dup_inheritable(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: dup on a live descriptor; the result is checked below.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `dup` is a fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Map `sources[i]` onto `3 + i` in a freshly forked child, clearing `FD_CLOEXEC`.
///
/// Runs between fork and exec: only async-signal-safe calls, no allocation. Sources must all
/// lie above the target range, which [`DescriptorSet::bind`] guarantees.
pub(crate) fn remap_for_child(sources: &[RawFd]) -> io::Result<()> {
    for (i, &source) in sources.iter().enumerate() {
        let target = FIRST_INHERITED_FD + i as RawFd;
        // SAFETY: dup2/fcntl are async-signal-safe and operate on descriptors inherited
        // through fork.
        unsafe {
            if libc::dup2(source, target) < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = libc::fcntl(target, libc::F_GETFD);
            if flags < 0 || libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Adopt the `count` descriptors inherited from the supervisor, in order.
pub(crate) fn inherit(count: usize) -> Result<Vec<GracefulListener>> {
    (0..count)
        .map(|i| adopt(FIRST_INHERITED_FD + i as RawFd))
        .collect()
}

fn adopt(fd: RawFd) -> Result<GracefulListener> {
    check_inherited(fd)?;

    // Keep the listener out of anything the user program spawns.
    // SAFETY: fcntl on a descriptor known to be open.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }

    // SAFETY: an open stream socket, inherited for our exclusive use.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    let listener = GracefulListener::from_std(std_listener).map_err(|e| Error::Descriptor {
        fd,
        reason: e.to_string(),
    })?;

    info!(fd, addr = %listener.local_addr(), "Inherited listener from supervisor");
    Ok(listener)
}

/// An inherited descriptor must be an open stream socket.
fn check_inherited(fd: RawFd) -> Result<()> {
    let rejected = |reason: String| Error::Descriptor { fd, reason };

    // SAFETY: F_GETFD only reads the descriptor table.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(rejected(format!("not open: {}", io::Error::last_os_error())));
    }
    // SAFETY: open as checked above; the borrow does not outlive this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match SockRef::from(&borrowed).r#type() {
        Ok(kind) if kind == Type::STREAM => Ok(()),
        Ok(kind) => Err(rejected(format!("expected a stream socket, found {kind:?}"))),
        Err(e) => Err(rejected(format!("not a socket: {e}"))),
    }
}
