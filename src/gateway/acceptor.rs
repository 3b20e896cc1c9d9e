//! The acceptor thread: one blocking accept loop, one non-blocking
//! backend `connect()` per client, handed off to whichever worker
//! currently has the fewest active connections.

use std::net::TcpListener;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::gateway::worker::{NewConnection, WorkerHandle};
use crate::net::address;
use crate::net::{tcp, Error as NetError};
use crate::pg_error;
use crate::primary::{Candidate, PrimaryState, NO_PRIMARY};

/// How long the acceptor sleeps between `accept()` polls on the
/// non-blocking listener while waiting for shutdown to be noticed.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct Acceptor {
    listener: TcpListener,
    candidates: Arc<std::sync::RwLock<Vec<Candidate>>>,
    primary: Arc<PrimaryState>,
    workers: Vec<WorkerHandle>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl Acceptor {
    pub fn bind(
        host: &str,
        port: &str,
        candidates: Arc<std::sync::RwLock<Vec<Candidate>>>,
        primary: Arc<PrimaryState>,
        workers: Vec<WorkerHandle>,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> std::io::Result<Self> {
        let listener = bind_listener(host, port)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            candidates,
            primary,
            workers,
            running,
        })
    }

    pub fn run(mut self) {
        info!(
            addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "acceptor started"
        );
        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.handle_client(stream, peer),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
        info!("acceptor stopped");
    }

    fn handle_client(&mut self, stream: std::net::TcpStream, peer: std::net::SocketAddr) {
        if let Err(err) = tcp::set_nonblock(stream.as_raw_fd()) {
            warn!(peer = %peer, error = %err, "failed to set client socket non-blocking");
            return;
        }
        if let Err(err) = tcp::tweak(stream.as_raw_fd(), true) {
            warn!(peer = %peer, error = %err, "failed to tune client socket");
        }

        let (idx, epoch) = self.primary.snapshot();
        if idx == NO_PRIMARY {
            self.reject_no_primary(stream, peer);
            return;
        }

        let target_addr = {
            let guard = self.candidates.read().expect("candidates lock poisoned");
            guard.get(idx as usize).map(|c| c.address.socket_addr())
        };
        let Some(target_addr) = target_addr else {
            self.reject_no_primary(stream, peer);
            return;
        };

        match connect_backend(target_addr) {
            Ok(backend_fd) => {
                let client_fd = stream.into_raw_fd();
                self.dispatch(client_fd, backend_fd, epoch);
            }
            Err(err) => {
                warn!(peer = %peer, backend = ?target_addr, error = %err, "backend connect failed");
                self.reject_no_primary(stream, peer);
            }
        }
    }

    fn reject_no_primary(&self, stream: std::net::TcpStream, peer: std::net::SocketAddr) {
        use std::io::Write;
        let mut stream = stream;
        let frame = pg_error::no_primary_available();
        let _ = stream.write_all(&frame);
        debug_reject(peer);
    }

    fn dispatch(&self, client_fd: RawFd, backend_fd: RawFd, epoch: i64) {
        let Some(target) = self
            .workers
            .iter()
            .min_by_key(|w| w.active_connections.load(Ordering::Relaxed))
        else {
            unsafe {
                libc::close(client_fd);
                libc::close(backend_fd);
            }
            return;
        };

        // Claim the slot synchronously so a second accept racing this
        // one sees the updated count immediately, rather than reading
        // a stale value before the worker drains its channel and
        // increments it itself.
        target.active_connections.fetch_add(1, Ordering::Relaxed);

        target.dispatch(NewConnection {
            client_fd,
            backend_fd,
            epoch_bound: epoch,
        });
    }
}

fn debug_reject(peer: std::net::SocketAddr) {
    tracing::debug!(peer = %peer, "rejected client: no primary available");
}

/// Start a non-blocking `connect()` to `addr`. Returns the backend
/// fd once the connect is either complete or in progress
/// (`EINPROGRESS`); the owning worker finishes the handshake by
/// polling writability and checking `SO_ERROR`.
fn connect_backend(addr: std::net::SocketAddr) -> Result<RawFd, NetError> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(crate::net::syscall_error("socket"));
    }

    tcp::set_nonblock(fd)?;
    if let Err(err) = tcp::tweak(fd, true) {
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    let sockaddr = socket2::SockAddr::from(addr);
    let rc = unsafe { libc::connect(fd, sockaddr.as_ptr() as *const _, sockaddr.len()) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe {
                libc::close(fd);
            }
            return Err(crate::net::Error::Syscall("connect", err));
        }
    }

    Ok(fd)
}

/// Bind the gateway's listening socket. Matches the original source's
/// policy: try the requested host, falling back from `::` to
/// `0.0.0.0` if dual-stack binding isn't available, with
/// `SO_REUSEADDR`/`SO_REUSEPORT` set so restarts don't hit
/// `EADDRINUSE`.
fn bind_listener(host: &str, port: &str) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let mut last_err = None;
    for socket_addr in address::resolve_listen_addrs(host, port)? {
        let domain = if socket_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(s) => s,
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        };

        let _ = socket.set_reuse_address(true);
        #[cfg(target_os = "linux")]
        let _ = socket.set_reuse_port(true);
        if socket_addr.is_ipv6() {
            let _ = socket.set_only_v6(false);
        }

        match socket.bind(&socket_addr.into()).and_then(|_| socket.listen(1024)) {
            Ok(()) => return Ok(socket.into()),
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "no bindable address")
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bind_listener_loopback() {
        let listener = bind_listener("127.0.0.1", "0").unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_connect_backend_to_loopback_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = connect_backend(addr).unwrap();
        assert!(fd >= 0);
        unsafe {
            libc::close(fd);
        }
    }
}
