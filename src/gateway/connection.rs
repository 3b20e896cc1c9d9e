//! A single client↔backend relay: two raw sockets joined by a pair of
//! kernel pipes, driven by `splice(2)` with no userspace copy.
//!
//! `Connection` owns its fds and pipes outright and is never put
//! behind a mutex. Teardown frees the struct by simply dropping it
//! (closing both fds and both pipes); there is no deferred reclamation
//! or generation-tagged slot table; the in-place invalidation sweep
//! the worker performs on each readiness batch (see
//! [`crate::gateway::worker`]) is what makes that safe — a
//! `Connection` never outlives the single batch in which it was
//! invalidated and torn down.

use std::os::fd::RawFd;

use crate::net::pipe::{self, Pipe, SpliceResult};
use crate::net::{tcp, Error};

/// Lifecycle stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Backend `connect()` issued non-blocking; waiting for the fd to
    /// become writable so `SO_ERROR` can be checked.
    Connecting,
    /// Both legs are live; splicing bytes in both directions.
    Established,
}

/// Why a connection was torn down, used only to pick a log level and
/// (for `BackendClosed`) to decide whether it counts as a user-visible
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    ClientClosed,
    BackendClosed,
    IoError,
    EpochMismatch,
}

/// Result of driving a connection one readiness batch forward.
pub enum DriveOutcome {
    /// Still alive; more data may be forthcoming.
    Alive,
    /// The connection is done and should be torn down.
    Done(TeardownReason),
}

pub struct Connection {
    pub client_fd: RawFd,
    pub backend_fd: RawFd,
    /// Epoch the primary was on when this connection was opened.
    /// Compared against [`crate::primary::PrimaryState`]'s current
    /// epoch on every batch; a mismatch means a failover happened and
    /// this connection must be torn down even though the sockets
    /// themselves are still healthy.
    pub epoch_bound: i64,
    pub state: ConnState,
    /// Client -> backend relay pipe.
    c2b: Pipe,
    /// Backend -> client relay pipe.
    b2c: Pipe,
    pub bytes_client_to_backend: u64,
    pub bytes_backend_to_client: u64,
    /// Set once both fds are registered with the worker's epoll
    /// instance and this connection is counted in
    /// `Worker::active_connections`; used to avoid double-counting on
    /// teardown if registration never completed.
    pub registered: bool,
}

impl Connection {
    pub fn new(client_fd: RawFd, backend_fd: RawFd, epoch_bound: i64) -> Result<Self, Error> {
        Ok(Self {
            client_fd,
            backend_fd,
            epoch_bound,
            state: ConnState::Connecting,
            c2b: Pipe::new()?,
            b2c: Pipe::new()?,
            bytes_client_to_backend: 0,
            bytes_backend_to_client: 0,
            registered: false,
        })
    }

    /// Check whether a non-blocking `connect()` to the backend has
    /// completed. Returns `Ok(true)` once connected, `Ok(false)` if
    /// still pending (shouldn't happen once writability fired, but
    /// handled defensively), `Err` if the connect failed outright.
    pub fn complete_connect(&mut self) -> Result<bool, Error> {
        tcp::take_socket_error(self.backend_fd)?;
        self.state = ConnState::Established;
        Ok(true)
    }

    /// Whether `backend_fd` currently needs `EPOLLOUT`: always while
    /// the non-blocking `connect()` is still pending (that's how its
    /// completion is detected), otherwise only when the client->backend
    /// pipe is holding bytes the backend hasn't drained yet.
    pub fn backend_write_interest(&self) -> Result<bool, Error> {
        if self.state == ConnState::Connecting {
            return Ok(true);
        }
        Ok(self.c2b.bytes_available()? > 0)
    }

    /// Whether `client_fd` currently needs `EPOLLOUT`: only when the
    /// backend->client pipe is holding bytes the client hasn't drained
    /// yet.
    pub fn client_write_interest(&self) -> Result<bool, Error> {
        Ok(self.b2c.bytes_available()? > 0)
    }

    /// Drive both relay directions until every fd reports `EAGAIN`,
    /// or until either side closes or errors.
    pub fn relay(&mut self) -> DriveOutcome {
        loop {
            let mut progressed = false;

            match self.step(self.client_fd, self.c2b.write_fd, true) {
                Ok(true) => progressed = true,
                Ok(false) => {}
                Err(reason) => return DriveOutcome::Done(reason),
            }
            match self.step(self.c2b.read_fd, self.backend_fd, true) {
                Ok(true) => progressed = true,
                Ok(false) => {}
                Err(reason) => return DriveOutcome::Done(reason),
            }
            match self.step(self.backend_fd, self.b2c.write_fd, false) {
                Ok(true) => progressed = true,
                Ok(false) => {}
                Err(reason) => return DriveOutcome::Done(reason),
            }
            match self.step(self.b2c.read_fd, self.client_fd, false) {
                Ok(true) => progressed = true,
                Ok(false) => {}
                Err(reason) => return DriveOutcome::Done(reason),
            }

            if !progressed {
                return DriveOutcome::Alive;
            }
        }
    }

    /// Splice once from `from_fd` to `to_fd`. `from_is_client` tags
    /// which leg an EOF/error on `from_fd` should be attributed to,
    /// and which byte counter a successful move increments (moves out
    /// of the client socket count toward client->backend regardless
    /// of which pipe leg they're passing through).
    fn step(&mut self, from_fd: RawFd, to_fd: RawFd, from_is_client: bool) -> Result<bool, TeardownReason> {
        match pipe::splice(from_fd, to_fd) {
            Ok(SpliceResult::Moved(n)) => {
                if from_is_client {
                    self.bytes_client_to_backend += n as u64;
                } else {
                    self.bytes_backend_to_client += n as u64;
                }
                Ok(true)
            }
            Ok(SpliceResult::WouldBlock) => Ok(false),
            Ok(SpliceResult::Eof) => Err(if from_is_client {
                TeardownReason::ClientClosed
            } else {
                TeardownReason::BackendClosed
            }),
            Err(_) => Err(TeardownReason::IoError),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            if self.client_fd >= 0 {
                libc::close(self.client_fd);
            }
            if self.backend_fd >= 0 {
                libc::close(self.backend_fd);
            }
        }
    }
}

// SAFETY: a Connection is created on and only ever touched from the
// single worker thread that owns it; Send just allows the acceptor
// thread to hand a freshly-created Connection off to its assigned
// worker.
unsafe impl Send for Connection {}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn connected_pair() -> (RawFd, RawFd) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        tcp::set_nonblock(client.as_raw_fd()).unwrap();
        tcp::set_nonblock(server.as_raw_fd()).unwrap();
        (client.into_raw_fd(), server.into_raw_fd())
    }

    #[test]
    fn test_relay_forwards_client_to_backend() {
        let (client_fd, backend_fd) = connected_pair();
        let mut conn = Connection::new(client_fd, backend_fd, 0).unwrap();
        conn.state = ConnState::Established;

        let mut client_side = unsafe {
            <std::net::TcpStream as std::os::fd::FromRawFd>::from_raw_fd(conn.client_fd)
        };
        client_side.write_all(b"hello").unwrap();
        std::mem::forget(client_side); // fd still owned by Connection.

        std::thread::sleep(std::time::Duration::from_millis(20));
        match conn.relay() {
            DriveOutcome::Alive => {}
            DriveOutcome::Done(reason) => panic!("unexpected teardown: {reason:?}"),
        }
        assert_eq!(conn.bytes_client_to_backend, 5);
    }

    #[test]
    fn test_relay_detects_teardown_on_invalid_client_fd() {
        let (client_fd, backend_fd) = connected_pair();
        unsafe {
            libc::close(client_fd);
        }
        // client_fd = -1 (never valid) stands in for "already closed";
        // splice() on it fails with EBADF, which the relay loop treats
        // as IoError. Exercising the real ClientClosed/EOF path is
        // covered by the integration test against a live loopback pair.
        let mut conn = Connection::new(-1, backend_fd, 0).unwrap();
        conn.state = ConnState::Established;
        match conn.relay() {
            DriveOutcome::Done(_) => {}
            DriveOutcome::Alive => panic!("expected teardown on invalid client fd"),
        }
    }
}
