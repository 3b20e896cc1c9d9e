//! Environment-derived configuration.
//!
//! Unlike the teacher's TOML-backed, per-database configuration
//! surface, this gateway has five scalar knobs and a candidate list,
//! all of which fit naturally as environment variables (the original
//! source's own configuration mechanism).

use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_PG_DATABASE: &str = "postgres";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 800;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 500;
const DEFAULT_CHECK_EVERY_SECS: u64 = 2;
const DEFAULT_NUM_THREADS: usize = 1;
const DEFAULT_LISTEN_HOST: &str = "localhost";
const DEFAULT_LISTEN_PORT: &str = "5432";
const DEFAULT_METRICS_HOST: &str = "::";
const DEFAULT_METRICS_PORT: &str = "9090";
const MIN_THREADS: usize = 1;
const MAX_THREADS: usize = 64;

/// Configuration error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("CANDIDATES env var required")]
    MissingCandidates,

    #[error("invalid candidate format '{0}' (expected host:port)")]
    InvalidCandidate(String),

    #[error("invalid value for {var}: '{value}'")]
    InvalidInt { var: &'static str, value: String },

    #[error("NUM_THREADS must be between {min} and {max}, got {value}")]
    ThreadsOutOfRange {
        value: i64,
        min: usize,
        max: usize,
    },
}

/// A configured backend before DNS resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSpec {
    pub host: String,
    pub port: String,
}

/// Gateway configuration, assembled once at startup from the
/// environment and (for the listen address) optional CLI overrides.
#[derive(Debug, Clone)]
pub struct Config {
    pub candidates: Vec<CandidateSpec>,
    pub pg_database: String,
    pub pg_user: String,
    pub pg_password: String,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub check_every: Duration,
    pub num_threads: usize,
    pub listen_host: String,
    pub listen_port: String,
    pub metrics_host: String,
    pub metrics_port: String,
    pub tcp_keepalive: bool,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        let candidates = parse_candidates(&env_var("CANDIDATES"))?;

        let pg_database = env_var("PGDATABASE").unwrap_or_else(|| DEFAULT_PG_DATABASE.into());
        let pg_user = env_var("PGUSER").unwrap_or_default();
        let pg_password = env_var("PGPASSWORD").unwrap_or_default();

        let connect_timeout = Duration::from_millis(parse_u64(
            "CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
        )?);
        let query_timeout =
            Duration::from_millis(parse_u64("QUERY_TIMEOUT_MS", DEFAULT_QUERY_TIMEOUT_MS)?);
        let check_every =
            Duration::from_secs(parse_u64("CHECK_EVERY", DEFAULT_CHECK_EVERY_SECS)?);

        let num_threads = parse_num_threads()?;

        let listen_host = env_var("LISTEN_HOST").unwrap_or_else(|| DEFAULT_LISTEN_HOST.into());
        let listen_port = env_var("LISTEN_PORT").unwrap_or_else(|| DEFAULT_LISTEN_PORT.into());

        let metrics_host = env_var("METRICS_HOST").unwrap_or_else(|| DEFAULT_METRICS_HOST.into());
        let metrics_port = env_var("METRICS_PORT").unwrap_or_else(|| DEFAULT_METRICS_PORT.into());

        let tcp_keepalive = match env_var("TCP_KEEPALIVE") {
            None => true,
            Some(v) => parse_i64_raw("TCP_KEEPALIVE", &v)? != 0,
        };

        Ok(Self {
            candidates,
            pg_database,
            pg_user,
            pg_password,
            connect_timeout,
            query_timeout,
            check_every,
            num_threads,
            listen_host,
            listen_port,
            metrics_host,
            metrics_port,
            tcp_keepalive,
        })
    }

    /// Apply CLI-level overrides (positional listen address, explicit
    /// thread count).
    pub fn with_overrides(
        mut self,
        listen_host: Option<String>,
        listen_port: Option<String>,
        num_threads: Option<usize>,
    ) -> Self {
        if let Some(host) = listen_host {
            self.listen_host = host;
        }
        if let Some(port) = listen_port {
            self.listen_port = port;
        }
        if let Some(threads) = num_threads {
            self.num_threads = threads.clamp(MIN_THREADS, MAX_THREADS);
        }
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_i64_raw(var: &'static str, value: &str) -> Result<i64, Error> {
    value.trim().parse::<i64>().map_err(|_| Error::InvalidInt {
        var,
        value: value.to_string(),
    })
}

fn parse_u64(var: &'static str, default: u64) -> Result<u64, Error> {
    match env_var(var) {
        None => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| Error::InvalidInt {
            var,
            value: v,
        }),
    }
}

fn parse_num_threads() -> Result<usize, Error> {
    let value = match env_var("NUM_THREADS") {
        None => return Ok(DEFAULT_NUM_THREADS),
        Some(v) => parse_i64_raw("NUM_THREADS", &v)?,
    };

    let clamped = value.clamp(MIN_THREADS as i64, MAX_THREADS as i64);
    Ok(clamped as usize)
}

/// Parse the `CANDIDATES` env var: `host1:port1,host2:port2,...`.
fn parse_candidates(raw: &Option<String>) -> Result<Vec<CandidateSpec>, Error> {
    let raw = raw.as_deref().ok_or(Error::MissingCandidates)?;

    raw.split(',')
        .map(|tok| {
            let tok = tok.trim();
            let (host, port) = tok
                .rsplit_once(':')
                .ok_or_else(|| Error::InvalidCandidate(tok.to_string()))?;
            if host.is_empty() || port.is_empty() {
                return Err(Error::InvalidCandidate(tok.to_string()));
            }
            Ok(CandidateSpec {
                host: host.to_string(),
                port: port.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_candidates() {
        let raw = Some("10.0.0.1:5432, 10.0.0.2:5432".to_string());
        let parsed = parse_candidates(&raw).unwrap();
        assert_eq!(
            parsed,
            vec![
                CandidateSpec {
                    host: "10.0.0.1".into(),
                    port: "5432".into()
                },
                CandidateSpec {
                    host: "10.0.0.2".into(),
                    port: "5432".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_candidates_missing() {
        assert!(matches!(
            parse_candidates(&None),
            Err(Error::MissingCandidates)
        ));
    }

    #[test]
    fn test_parse_candidates_bad_format() {
        let raw = Some("not-a-candidate".to_string());
        assert!(matches!(
            parse_candidates(&raw),
            Err(Error::InvalidCandidate(_))
        ));
    }

    #[test]
    fn test_parse_candidates_ipv6_host() {
        // rsplit_once on ':' means IPv6 literals need bracket support;
        // out of scope for CANDIDATES (hostnames/IPv4 only in practice),
        // but a trailing :port still parses off the last colon.
        let raw = Some("myhost:5432".to_string());
        let parsed = parse_candidates(&raw).unwrap();
        assert_eq!(parsed[0].host, "myhost");
        assert_eq!(parsed[0].port, "5432");
    }

    #[test]
    fn test_thread_clamp_via_overrides() {
        let cfg = Config {
            candidates: vec![],
            pg_database: "postgres".into(),
            pg_user: "".into(),
            pg_password: "".into(),
            connect_timeout: Duration::from_millis(800),
            query_timeout: Duration::from_millis(500),
            check_every: Duration::from_secs(2),
            num_threads: 1,
            listen_host: "localhost".into(),
            listen_port: "5432".into(),
            metrics_host: "::".into(),
            metrics_port: "9090".into(),
            tcp_keepalive: true,
        };
        let cfg = cfg.with_overrides(None, None, Some(999));
        assert_eq!(cfg.num_threads, MAX_THREADS);
    }
}
