//! Low-level networking primitives for the data plane.
//!
//! Everything in this module talks directly to Linux: raw fds, raw
//! `libc` calls, no async runtime. The one exception is
//! [`pg_wire`], which is used only by the (Tokio-driven) primary
//! discovery task.

pub mod address;
pub mod pg_wire;
pub mod pipe;
pub mod readiness;
pub mod tcp;

use thiserror::Error;

/// Errors raised by the networking primitives.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} failed: {1}")]
    Syscall(&'static str, std::io::Error),

    #[error("could not resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{host}:{port} resolved to no addresses")]
    NoAddress { host: String, port: String },

    #[error("postgres wire protocol: {0}")]
    Wire(String),
}

/// Build an [`Error::Syscall`] from the current `errno`.
pub(crate) fn syscall_error(what: &'static str) -> Error {
    Error::Syscall(what, std::io::Error::last_os_error())
}
