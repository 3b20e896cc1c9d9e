//! Primary discovery: the async Tokio task that periodically probes
//! every candidate and republishes [`PrimaryState`] when the writable
//! primary changes.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::interval;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::net::address::{self, TargetAddress};
use crate::net::pg_wire;
use crate::primary::{Candidate, PrimaryState, NO_PRIMARY};

/// Classification of a single candidate from one probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Primary,
    /// A second (or later) candidate that also probed writable.
    /// Indicates a split-brain cluster; never routed to — only the
    /// first writable candidate in configured order becomes primary.
    PrimaryNotUsed,
    Replica,
    Unhealthy,
}

/// Run discovery cycles until `running` is cleared. Resolves each
/// candidate's address fresh every cycle (so a DNS change behind a
/// stable hostname is picked up), probes it, and publishes a new
/// primary index whenever the classification changes which candidate
/// (if any) is writable.
pub async fn run(
    config: Arc<Config>,
    candidates: Arc<std::sync::RwLock<Vec<Candidate>>>,
    primary: Arc<PrimaryState>,
    metrics: Arc<Metrics>,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut ticker = interval(config.check_every);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
        run_cycle(&config, &candidates, &primary, &metrics).await;
    }
}

async fn run_cycle(
    config: &Config,
    candidates: &Arc<std::sync::RwLock<Vec<Candidate>>>,
    primary: &Arc<PrimaryState>,
    metrics: &Arc<Metrics>,
) {
    let specs: Vec<_> = candidates
        .read()
        .expect("candidates lock poisoned")
        .iter()
        .map(|c| c.spec.clone())
        .collect();

    let mut results = Vec::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        let addr = match address::resolve(&spec.host, &spec.port) {
            Ok(addr) => addr,
            Err(err) => {
                warn!(host = %spec.host, port = %spec.port, error = %err, "candidate DNS resolution failed");
                results.push((addr_placeholder(), Health::Unhealthy));
                continue;
            }
        };

        // Take this candidate's persistent probe session out for the
        // duration of the probe, so the lock isn't held across an
        // await point; put back whatever the probe leaves us with
        // (a reusable session on success, none on failure).
        let session = candidates
            .write()
            .expect("candidates lock poisoned")
            .get_mut(idx)
            .and_then(|c| c.take_session());

        let (health, session) = probe(config, addr, session).await;

        if let Some(candidate) = candidates.write().expect("candidates lock poisoned").get_mut(idx) {
            candidate.set_session(session);
        }

        results.push((addr, health));
    }

    // Only the first writable candidate in configured order is ever
    // routed to; any later one that also probes writable indicates a
    // split-brain cluster and is reclassified for logging/metrics.
    let mut seen_primary = false;
    for (_, health) in results.iter_mut() {
        if *health == Health::Primary {
            if seen_primary {
                *health = Health::PrimaryNotUsed;
            }
            seen_primary = true;
        }
    }

    let healthy_count = results.iter().filter(|(_, h)| *h != Health::Unhealthy).count();
    metrics.set_servers(results.len() as i64, healthy_count as i64);

    let new_primary_idx = results
        .iter()
        .position(|(_, h)| *h == Health::Primary)
        .map(|i| i as i64)
        .unwrap_or(NO_PRIMARY);

    for (spec, (addr, health)) in specs.iter().zip(results.iter()) {
        info!(host = %spec.host, port = %spec.port, addr = %addr.socket_addr(), status = ?health, "candidate status");
    }

    {
        let mut guard = candidates.write().expect("candidates lock poisoned");
        for (candidate, (addr, _)) in guard.iter_mut().zip(results.iter()) {
            candidate.address = *addr;
        }
    }

    let changed = primary.publish(new_primary_idx, false);
    if changed {
        if new_primary_idx == NO_PRIMARY {
            warn!("no writable primary currently available");
        } else {
            info!(primary_idx = new_primary_idx, "primary changed");
        }
    }
}

async fn probe(
    config: &Config,
    addr: TargetAddress,
    session: Option<tokio::net::TcpStream>,
) -> (Health, Option<tokio::net::TcpStream>) {
    let result = pg_wire::check_primary(
        addr.socket_addr(),
        &config.pg_database,
        &config.pg_user,
        &config.pg_password,
        config.connect_timeout,
        config.query_timeout,
        session,
    )
    .await;

    match result {
        Ok((false, session)) => (Health::Primary, Some(session)), // transaction_read_only = off
        Ok((true, session)) => (Health::Replica, Some(session)),
        Err(err) => {
            warn!(addr = %addr.socket_addr(), error = %err, "candidate health probe failed");
            (Health::Unhealthy, None)
        }
    }
}

fn addr_placeholder() -> TargetAddress {
    TargetAddress("0.0.0.0:0".parse().unwrap())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_addr_placeholder_is_unspecified() {
        let addr = addr_placeholder();
        assert!(addr.socket_addr().ip().is_unspecified());
    }
}
