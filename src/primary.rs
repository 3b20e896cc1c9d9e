//! Process-wide knowledge of which candidate is the current primary.
//!
//! `primary_idx`/`epoch` are read on every accept and every
//! readiness-batch iteration across all worker threads, and written
//! exactly once per discovery cycle. They're plain atomics rather
//! than a mutex or `ArcSwap` because the hot path (acceptor, workers)
//! only ever needs a relaxed snapshot; the store side uses `Release`
//! so a worker that observes the new epoch also observes the new
//! index.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::net::TcpStream;

use crate::config::CandidateSpec;
use crate::net::address::TargetAddress;

/// No candidate is currently known to be the primary.
pub const NO_PRIMARY: i64 = -1;

/// A configured backend, its current resolved address, and a private
/// handle to the authenticated health-probe session discovery keeps
/// open against it between cycles, avoiding a reconnect/re-auth
/// round trip on every probe.
pub struct Candidate {
    pub spec: CandidateSpec,
    pub address: TargetAddress,
    session: Option<TcpStream>,
}

impl Candidate {
    pub fn new(spec: CandidateSpec, address: TargetAddress) -> Self {
        Self {
            spec,
            address,
            session: None,
        }
    }

    /// Take the persistent probe session out, if one exists, for the
    /// duration of a single probe. Left empty until [`Self::set_session`]
    /// puts a (possibly new) session back.
    pub fn take_session(&mut self) -> Option<TcpStream> {
        self.session.take()
    }

    /// Store the session to reuse next cycle, or `None` to force a
    /// fresh connect/authenticate on the next probe (set after any
    /// probe failure).
    pub fn set_session(&mut self, session: Option<TcpStream>) {
        self.session = session;
    }
}

/// The shared, atomically-updated pointer to "the current primary".
///
/// `epoch` increments on every write to `primary_idx`, including
/// writes that set it back to [`NO_PRIMARY`]. Workers snapshot
/// `(primary_idx, epoch)` once per readiness batch and compare it
/// against the epoch each connection was opened under to decide
/// whether that connection has been invalidated by a failover.
#[derive(Debug, Default)]
pub struct PrimaryState {
    primary_idx: AtomicI64,
    epoch: AtomicI64,
}

impl PrimaryState {
    pub fn new() -> Self {
        Self {
            primary_idx: AtomicI64::new(NO_PRIMARY),
            epoch: AtomicI64::new(0),
        }
    }

    /// Snapshot `(primary_idx, epoch)` with acquire ordering so a
    /// reader that sees a new epoch also sees the index it was
    /// published with.
    pub fn snapshot(&self) -> (i64, i64) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let idx = self.primary_idx.load(Ordering::Relaxed);
        (idx, epoch)
    }

    pub fn current_epoch(&self) -> i64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Publish a new primary index, bumping the epoch. A no-op
    /// (`idx` unchanged) still bumps the epoch when `force` is set,
    /// which discovery uses to invalidate outstanding connections
    /// even when the primary candidate's identity hasn't changed
    /// (e.g. it went unhealthy and came back at the same index).
    pub fn publish(&self, idx: i64, force: bool) -> bool {
        let previous = self.primary_idx.swap(idx, Ordering::Relaxed);
        let changed = previous != idx;
        if changed || force {
            self.epoch.fetch_add(1, Ordering::Release);
        }
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_publish_bumps_epoch_on_change() {
        let state = PrimaryState::new();
        let (idx, epoch0) = state.snapshot();
        assert_eq!(idx, NO_PRIMARY);

        let changed = state.publish(2, false);
        assert!(changed);
        let (idx, epoch1) = state.snapshot();
        assert_eq!(idx, 2);
        assert!(epoch1 > epoch0);
    }

    #[test]
    fn test_publish_same_index_without_force_keeps_epoch() {
        let state = PrimaryState::new();
        state.publish(1, false);
        let (_, epoch_before) = state.snapshot();
        let changed = state.publish(1, false);
        assert!(!changed);
        let (_, epoch_after) = state.snapshot();
        assert_eq!(epoch_before, epoch_after);
    }

    #[test]
    fn test_publish_same_index_with_force_bumps_epoch() {
        let state = PrimaryState::new();
        state.publish(1, false);
        let (_, epoch_before) = state.snapshot();
        state.publish(1, true);
        let (_, epoch_after) = state.snapshot();
        assert!(epoch_after > epoch_before);
    }
}
