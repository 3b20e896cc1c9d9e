//! Edge-triggered readiness substrate: a thin wrapper over
//! `epoll_create1`/`epoll_ctl`/`epoll_wait`.
//!
//! Each forwarder worker and the acceptor own exactly one
//! [`Readiness`] instance. Interest is always registered
//! edge-triggered (`EPOLLET`); level-triggered semantics would let a
//! single connection starve a batch by being re-reported every
//! `wait()` call even when nothing new has happened.

use std::os::fd::RawFd;

use super::{syscall_error, Error};

/// Cap on events drained per `wait()` call. Matches the original
/// source's fixed-size `epoll_event` batch.
const MAX_EVENTS: usize = 4096;

pub const READABLE: u32 = libc::EPOLLIN as u32;
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
pub const HUP: u32 = (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
pub const ERR: u32 = libc::EPOLLERR as u32;

/// One readiness-reported event: the opaque tag registered alongside
/// the fd, and the flags that fired.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub tag: u64,
    pub flags: u32,
}

/// A single `epoll` instance.
pub struct Readiness {
    epfd: RawFd,
}

impl Readiness {
    pub fn new() -> Result<Self, Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(syscall_error("epoll_create1"));
        }
        Ok(Self { epfd })
    }

    /// Register `fd` for edge-triggered readability/writability,
    /// tagging the event with `tag` (typically a pointer-sized
    /// connection identifier).
    pub fn register(&self, fd: RawFd, tag: u64, flags: u32) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, tag, flags)
    }

    pub fn modify(&self, fd: RawFd, tag: u64, flags: u32) -> Result<(), Error> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, tag, flags)
    }

    pub fn deregister(&self, fd: RawFd) -> Result<(), Error> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            // Already gone (closed) is not an error worth surfacing.
            if err.raw_os_error() == Some(libc::ENOENT) || err.raw_os_error() == Some(libc::EBADF)
            {
                return Ok(());
            }
            return Err(Error::Syscall("epoll_ctl(DEL)", err));
        }
        Ok(())
    }

    fn ctl(&self, op: i32, fd: RawFd, tag: u64, flags: u32) -> Result<(), Error> {
        let mut ev = libc::epoll_event {
            events: flags | libc::EPOLLET as u32,
            u64: tag,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(syscall_error("epoll_ctl"));
        }
        Ok(())
    }

    /// Block until at least one fd is ready (or `timeout_ms` elapses;
    /// `-1` blocks indefinitely), returning the batch of events.
    pub fn wait(&self, timeout_ms: i32) -> Result<Vec<Event>, Error> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                raw.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(Error::Syscall("epoll_wait", err));
        }
        Ok(raw[..n as usize]
            .iter()
            .map(|e| Event {
                tag: e.u64,
                flags: e.events,
            })
            .collect())
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

// SAFETY: the epoll fd is only ever touched through `&self` methods
// that call into thread-safe kernel syscalls; ownership of the worker
// thread is singular (one `Readiness` per worker), `Send` just lets
// the instance be moved into its owning thread at spawn time.
unsafe impl Send for Readiness {}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_register_and_wait() {
        let r = Readiness::new().unwrap();
        let (rd, wr) = super::super::pipe::raw_pipe().unwrap();
        r.register(rd, 42, READABLE).unwrap();

        unsafe {
            libc::write(wr, b"x".as_ptr() as *const _, 1);
        }

        let events = r.wait(1000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, 42);
        assert_ne!(events[0].flags & READABLE, 0);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_deregister_missing_fd_is_ok() {
        let r = Readiness::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        drop(listener);
        // fd is closed now; DEL should fail with ENOENT/EBADF, which we swallow.
        let _ = r.deregister(fd);
    }
}
