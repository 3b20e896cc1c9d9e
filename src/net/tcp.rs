//! TCP socket option tuning for raw, manually-managed file descriptors.
//!
//! Every socket the data plane touches (client and backend legs) is a
//! bare `RawFd`: it isn't wrapped in `std::net::TcpStream` because the
//! connection's lifecycle (leak-on-close, manual `-1` sentinels) is
//! managed by [`crate::gateway::connection::Connection`] directly.
//! `socket2::SockRef::from` lets us reuse `socket2`'s sockopt helpers
//! on a borrowed fd without taking ownership.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use socket2::SockRef;

use super::{syscall_error, Error};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 3;

/// Put `fd` into non-blocking mode via `fcntl(F_SETFL, O_NONBLOCK)`.
pub fn set_nonblock(fd: RawFd) -> Result<(), Error> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(syscall_error("fcntl(F_GETFL)"));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(syscall_error("fcntl(F_SETFL)"));
        }
    }
    Ok(())
}

/// Apply `TCP_NODELAY` and, if `keepalive` is set, a keepalive policy
/// of 60s idle / 10s interval / 3 probes — matching the original
/// source's connection tuning.
pub fn tweak(fd: RawFd, keepalive: bool) -> Result<(), Error> {
    let borrowed = unsafe { borrow(fd) };
    let sock = SockRef::from(&borrowed);

    sock.set_nodelay(true)
        .map_err(|e| Error::Syscall("setsockopt(TCP_NODELAY)", e))?;

    if keepalive {
        let params = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        sock.set_tcp_keepalive(&params)
            .map_err(|e| Error::Syscall("setsockopt(SO_KEEPALIVE)", e))?;
    } else {
        sock.set_keepalive(false)
            .map_err(|e| Error::Syscall("setsockopt(SO_KEEPALIVE)", e))?;
    }

    Ok(())
}

/// Read `SO_ERROR` off `fd`, used to discover whether a non-blocking
/// `connect(2)` succeeded once the fd becomes writable.
pub fn take_socket_error(fd: RawFd) -> Result<(), Error> {
    let borrowed = unsafe { borrow(fd) };
    let sock = SockRef::from(&borrowed);
    match sock.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(e)) => Err(Error::Syscall("connect", e)),
        Err(e) => Err(Error::Syscall("getsockopt(SO_ERROR)", e)),
    }
}

/// # Safety
/// `fd` must remain open and valid for the lifetime of the borrow,
/// which callers here keep scoped to a single sockopt call.
unsafe fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Translate a bare connect() errno into an [`io::Error`], used by the
/// acceptor when starting a non-blocking connect to the backend.
pub fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_tweak_loopback_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        tweak(client.as_raw_fd(), true).unwrap();
        tweak(client.as_raw_fd(), false).unwrap();
    }

    #[test]
    fn test_set_nonblock() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        set_nonblock(client.as_raw_fd()).unwrap();
    }
}
