//! Top-level error type.

use thiserror::Error;

/// Errors that can terminate startup or a top-level task.
///
/// The data plane itself never returns a `Result` out of a worker or
/// the acceptor: every failure there resolves into a teardown reason
/// (see [`crate::gateway::connection::TeardownReason`]) and is handled
/// locally. This type only covers the handful of operations that can
/// fail before the gateway is up, or the ambient Tokio tasks.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] crate::config::Error),

    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("listener bind failed for {host}:{port}: {source}")]
    ListenerBind {
        host: String,
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics endpoint bind failed for {host}:{port}: {source}")]
    MetricsBind {
        host: String,
        port: String,
        #[source]
        source: std::io::Error,
    },
}
