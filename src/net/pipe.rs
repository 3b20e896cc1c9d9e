//! Kernel pipes used as the zero-copy relay buffer between a client
//! and backend socket, and the `splice(2)` helpers that move bytes
//! through them.

use std::os::fd::RawFd;

use super::{syscall_error, Error};

/// Pipe buffer size requested via `fcntl(F_SETPIPE_SZ)`. The kernel
/// may round this down to its own maximum; we don't treat a smaller
/// grant as an error.
const PIPE_SIZE: i32 = 1024 * 1024;

/// `splice(2)` moves at most this many bytes per call so one
/// direction can't monopolize a worker iteration indefinitely.
pub const SPLICE_CHUNK: usize = 128 * 1024;

/// One leg of the relay: a non-blocking, close-on-exec pipe sized up
/// to 1 MiB.
#[derive(Debug)]
pub struct Pipe {
    pub read_fd: RawFd,
    pub write_fd: RawFd,
}

impl Pipe {
    pub fn new() -> Result<Self, Error> {
        let (read_fd, write_fd) = raw_pipe()?;

        unsafe {
            // Best-effort: a smaller pipe still works, just with more
            // splice() round trips under load.
            libc::fcntl(read_fd, libc::F_SETPIPE_SZ, PIPE_SIZE);
        }

        Ok(Self { read_fd, write_fd })
    }

    /// Bytes currently buffered in the pipe, via `ioctl(FIONREAD)`.
    pub fn bytes_available(&self) -> Result<usize, Error> {
        let mut n: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.read_fd, libc::FIONREAD, &mut n) };
        if rc < 0 {
            return Err(syscall_error("ioctl(FIONREAD)"));
        }
        Ok(n.max(0) as usize)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

// SAFETY: see Readiness's Send impl — one Pipe per Connection, and
// Connections only ever live on the worker thread that owns them.
unsafe impl Send for Pipe {}

/// Create a raw non-blocking, close-on-exec pipe pair without the
/// 1 MiB resize (used directly by tests and by [`Pipe::new`]).
pub fn raw_pipe() -> Result<(RawFd, RawFd), Error> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc < 0 {
        return Err(syscall_error("pipe2"));
    }
    Ok((fds[0], fds[1]))
}

/// Outcome of a single `splice()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceResult {
    /// `n` bytes moved.
    Moved(usize),
    /// The source returned EOF (0 bytes available, nothing to move).
    Eof,
    /// `EAGAIN`: nothing ready right now.
    WouldBlock,
}

/// Splice up to [`SPLICE_CHUNK`] bytes from `from_fd` to `to_fd`.
pub fn splice(from_fd: RawFd, to_fd: RawFd) -> Result<SpliceResult, Error> {
    let rc = unsafe {
        libc::splice(
            from_fd,
            std::ptr::null_mut(),
            to_fd,
            std::ptr::null_mut(),
            SPLICE_CHUNK,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };

    if rc > 0 {
        return Ok(SpliceResult::Moved(rc as usize));
    }
    if rc == 0 {
        return Ok(SpliceResult::Eof);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EAGAIN) {
        return Ok(SpliceResult::WouldBlock);
    }
    Err(Error::Syscall("splice", err))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pipe_roundtrip_splice() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        use std::io::Write;
        let mut client = client;
        client.write_all(b"hello").unwrap();

        use std::os::fd::AsRawFd;
        let pipe = Pipe::new().unwrap();

        // splice from the server's accepted socket into the pipe.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let moved = loop {
            match splice(server.as_raw_fd(), pipe.write_fd).unwrap() {
                SpliceResult::Moved(n) => break n,
                SpliceResult::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                SpliceResult::Eof => panic!("unexpected eof"),
            }
        };
        assert_eq!(moved, 5);
        assert_eq!(pipe.bytes_available().unwrap(), 5);
    }

    #[test]
    fn test_bytes_available_empty() {
        let pipe = Pipe::new().unwrap();
        assert_eq!(pipe.bytes_available().unwrap(), 0);
    }
}
