//! A forwarder worker: one OS thread, one `epoll` instance, an
//! arbitrary number of [`Connection`]s driven to completion.
//!
//! Each iteration: wait for readiness, snapshot the primary's current
//! epoch once, sweep the batch in place to null out any event that
//! belongs to a connection invalidated by this or an earlier event in
//! the same batch (so a connection torn down by event `i` is never
//! touched again by a duplicate event `j > i` referencing the same
//! fd), then drive every surviving connection.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::gateway::connection::{Connection, ConnState, DriveOutcome, TeardownReason};
use crate::metrics::Metrics;
use crate::net::readiness::{self, Readiness};
use crate::net::{pipe, tcp};
use crate::primary::PrimaryState;

/// Poll timeout for `epoll_wait`: long enough to idle cheaply, short
/// enough that a worker notices `running` flipping to false promptly
/// even without a wakeup-pipe write.
const POLL_TIMEOUT_MS: i32 = 1000;

/// A connection handed from the acceptor to a worker.
pub struct NewConnection {
    pub client_fd: RawFd,
    pub backend_fd: RawFd,
    pub epoch_bound: i64,
}

/// Per-worker handle visible to the acceptor for load balancing and
/// shutdown.
pub struct WorkerHandle {
    pub id: usize,
    pub active_connections: Arc<AtomicUsize>,
    sender: Sender<NewConnection>,
    wakeup_write_fd: RawFd,
}

impl WorkerHandle {
    /// Hand a new connection to this worker and poke its wakeup pipe
    /// so a blocked `epoll_wait` returns immediately.
    pub fn dispatch(&self, conn: NewConnection) {
        if self.sender.send(conn).is_err() {
            return; // worker thread has exited; acceptor will notice on join.
        }
        unsafe {
            let byte = 1u8;
            libc::write(self.wakeup_write_fd, &byte as *const u8 as *const _, 1);
        }
    }

    pub fn wake(&self) {
        unsafe {
            let byte = 1u8;
            libc::write(self.wakeup_write_fd, &byte as *const u8 as *const _, 1);
        }
    }
}

const WAKEUP_TAG: u64 = u64::MAX;

struct Slot {
    conn: Connection,
}

/// Runs on its own OS thread until `running` is cleared.
pub struct Worker {
    id: usize,
    readiness: Readiness,
    receiver: Receiver<NewConnection>,
    wakeup_read_fd: RawFd,
    wakeup_write_fd: RawFd,
    slots: HashMap<u64, Slot>,
    next_tag: u64,
    active_connections: Arc<AtomicUsize>,
    primary: Arc<PrimaryState>,
    metrics: Arc<Metrics>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl Worker {
    pub fn spawn(
        id: usize,
        primary: Arc<PrimaryState>,
        metrics: Arc<Metrics>,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> (WorkerHandle, std::thread::JoinHandle<()>) {
        let readiness = Readiness::new().expect("epoll_create1 failed");
        let (wakeup_read_fd, wakeup_write_fd) =
            pipe::raw_pipe().expect("wakeup pipe2 failed");
        tcp::set_nonblock(wakeup_read_fd).expect("set_nonblock(wakeup) failed");
        readiness
            .register(wakeup_read_fd, WAKEUP_TAG, readiness::READABLE)
            .expect("register wakeup pipe failed");

        let (sender, receiver) = std::sync::mpsc::channel();
        let active_connections = Arc::new(AtomicUsize::new(0));

        let handle = WorkerHandle {
            id,
            active_connections: active_connections.clone(),
            sender,
            wakeup_write_fd,
        };

        let mut worker = Worker {
            id,
            readiness,
            receiver,
            wakeup_read_fd,
            wakeup_write_fd,
            slots: HashMap::new(),
            next_tag: 0,
            active_connections,
            primary,
            metrics,
            running,
        };

        let join = std::thread::Builder::new()
            .name(format!("pg-gateway-worker-{id}"))
            .spawn(move || worker.run())
            .expect("failed to spawn worker thread");

        (handle, join)
    }

    fn run(&mut self) {
        info!(worker_id = self.id, "worker started");
        while self.running.load(Ordering::Relaxed) {
            self.drain_new_connections();

            let mut events = match self.readiness.wait(POLL_TIMEOUT_MS) {
                Ok(events) => events,
                Err(err) => {
                    warn!(worker_id = self.id, error = %err, "epoll_wait failed");
                    continue;
                }
            };

            let (_, epoch) = self.primary.snapshot();

            // In-place invalidation sweep: for every event whose
            // connection is stale (bound to an older epoch), null out
            // every later event in this same batch referencing the
            // same tag so it isn't processed twice.
            for i in 0..events.len() {
                let tag = events[i].tag;
                if tag == WAKEUP_TAG {
                    continue;
                }
                let stale = self
                    .slots
                    .get(&tag)
                    .map(|slot| slot.conn.epoch_bound != epoch)
                    .unwrap_or(false);
                if stale {
                    for j in (i + 1)..events.len() {
                        if events[j].tag == tag {
                            events[j].tag = WAKEUP_TAG;
                        }
                    }
                }
            }

            for event in &events {
                if event.tag == WAKEUP_TAG {
                    self.drain_wakeup_pipe();
                    continue;
                }
                self.service(event.tag, epoch);
            }
        }
        info!(worker_id = self.id, "worker stopped");
    }

    fn drain_wakeup_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.wakeup_read_fd,
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn drain_new_connections(&mut self) {
        while let Ok(new_conn) = self.receiver.try_recv() {
            self.accept_connection(new_conn);
        }
    }

    fn accept_connection(&mut self, new_conn: NewConnection) {
        let mut conn = match Connection::new(new_conn.client_fd, new_conn.backend_fd, new_conn.epoch_bound) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(worker_id = self.id, error = %err, "failed to allocate connection");
                unsafe {
                    libc::close(new_conn.client_fd);
                    libc::close(new_conn.backend_fd);
                }
                self.active_connections.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        if tag == WAKEUP_TAG {
            self.next_tag = self.next_tag.wrapping_add(1);
        }

        // The acceptor already claimed this connection's slot in
        // `active_connections` synchronously at dispatch time, before
        // the two sides of the worker selection could race. Only
        // release it here if the connection never actually comes up.
        let client_flags = readiness::READABLE | readiness::HUP;
        let backend_flags = readiness::READABLE | readiness::HUP | readiness::WRITABLE;
        if self.readiness.register(conn.client_fd, tag, client_flags).is_err()
            || self.readiness.register(conn.backend_fd, tag, backend_flags).is_err()
        {
            warn!(worker_id = self.id, "failed to register connection with epoll");
            self.active_connections.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        conn.registered = true;
        self.metrics.inc_active_connections();
        self.metrics.inc_total_connections();
        self.slots.insert(tag, Slot { conn });
    }

    fn service(&mut self, tag: u64, current_epoch: i64) {
        let Some(slot) = self.slots.get_mut(&tag) else {
            return;
        };

        if slot.conn.epoch_bound != current_epoch {
            self.teardown(tag, TeardownReason::EpochMismatch);
            return;
        }

        if slot.conn.state == ConnState::Connecting {
            if let Err(err) = slot.conn.complete_connect() {
                debug!(worker_id = self.id, error = %err, "backend connect failed");
                self.teardown(tag, TeardownReason::IoError);
                return;
            }
        }

        let outcome = slot.conn.relay();
        if let DriveOutcome::Done(reason) = outcome {
            self.teardown(tag, reason);
            return;
        }

        self.rearm(tag);
    }

    /// Re-derive each fd's write interest from its pipe's current
    /// occupancy and re-register with epoll. Read/HUP interest is
    /// constant once registered; only `EPOLLOUT` needs to track
    /// whether the relay has anything buffered left to flush.
    fn rearm(&mut self, tag: u64) {
        let Some(slot) = self.slots.get(&tag) else {
            return;
        };

        let client_write = slot.conn.client_write_interest().unwrap_or(false);
        let backend_write = slot.conn.backend_write_interest().unwrap_or(false);

        let mut client_flags = readiness::READABLE | readiness::HUP;
        if client_write {
            client_flags |= readiness::WRITABLE;
        }
        let mut backend_flags = readiness::READABLE | readiness::HUP;
        if backend_write {
            backend_flags |= readiness::WRITABLE;
        }

        let _ = self.readiness.modify(slot.conn.client_fd, tag, client_flags);
        let _ = self.readiness.modify(slot.conn.backend_fd, tag, backend_flags);
    }

    fn teardown(&mut self, tag: u64, reason: TeardownReason) {
        let Some(slot) = self.slots.remove(&tag) else {
            return;
        };

        let _ = self.readiness.deregister(slot.conn.client_fd);
        let _ = self.readiness.deregister(slot.conn.backend_fd);

        self.metrics
            .add_bytes_client_to_backend(slot.conn.bytes_client_to_backend);
        self.metrics
            .add_bytes_backend_to_client(slot.conn.bytes_backend_to_client);

        if slot.conn.registered {
            self.active_connections.fetch_sub(1, Ordering::Relaxed);
            self.metrics.dec_active_connections();
        }

        match reason {
            TeardownReason::ClientClosed | TeardownReason::EpochMismatch => {
                debug!(worker_id = self.id, tag, reason = ?reason, "connection closed")
            }
            TeardownReason::BackendClosed => {
                warn!(worker_id = self.id, tag, "backend closed connection")
            }
            TeardownReason::IoError => {
                warn!(worker_id = self.id, tag, "connection closed due to I/O error")
            }
        }

        // `slot` drops here, closing both fds and both relay pipes.
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_read_fd);
            libc::close(self.wakeup_write_fd);
        }
    }
}
