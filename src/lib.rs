//! Library crate backing the `pg-gateway` binary, split out so
//! integration tests can exercise the data plane directly instead of
//! recompiling source files via `#[path]`.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod net;
pub mod pg_error;
pub mod primary;
