//! Ties the acceptor thread and the forwarder worker pool together.

pub mod acceptor;
pub mod connection;
pub mod worker;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::net::address;
use crate::primary::{Candidate, PrimaryState};
use acceptor::Acceptor;
use worker::Worker;

/// The running data plane: the acceptor thread and every worker
/// thread, joined together on shutdown.
pub struct Gateway {
    acceptor_handle: std::thread::JoinHandle<()>,
    worker_handles: Vec<std::thread::JoinHandle<()>>,
}

impl Gateway {
    /// Resolve every configured candidate, then spawn the worker pool
    /// and the acceptor thread.
    pub fn start(
        config: &Config,
        primary: Arc<PrimaryState>,
        metrics: Arc<Metrics>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<(Self, Arc<RwLock<Vec<Candidate>>>)> {
        let mut candidates = Vec::with_capacity(config.candidates.len());
        for spec in &config.candidates {
            let addr = address::resolve(&spec.host, &spec.port).map_err(|err| {
                std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
            })?;
            candidates.push(Candidate::new(spec.clone(), addr));
        }
        let candidates = Arc::new(RwLock::new(candidates));

        let mut worker_handles = Vec::with_capacity(config.num_threads);
        let mut worker_refs = Vec::with_capacity(config.num_threads);
        for id in 0..config.num_threads {
            let (handle, join) = Worker::spawn(id, primary.clone(), metrics.clone(), running.clone());
            worker_refs.push(handle);
            worker_handles.push(join);
        }

        info!(num_threads = config.num_threads, "worker pool started");

        let acceptor = Acceptor::bind(
            &config.listen_host,
            &config.listen_port,
            candidates.clone(),
            primary,
            worker_refs,
            running,
        )?;

        let acceptor_handle = std::thread::Builder::new()
            .name("pg-gateway-acceptor".to_string())
            .spawn(move || acceptor.run())
            .expect("failed to spawn acceptor thread");

        Ok((
            Self {
                acceptor_handle,
                worker_handles,
            },
            candidates,
        ))
    }

    /// Block until the acceptor and every worker thread has exited.
    /// Callers flip the shared `running` flag first.
    pub fn join(self) {
        let _ = self.acceptor_handle.join();
        for handle in self.worker_handles {
            let _ = handle.join();
        }
    }
}
