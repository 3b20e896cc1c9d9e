//! Entry point: load configuration, start the data plane (acceptor +
//! worker threads) and the ambient Tokio tasks (primary discovery,
//! metrics endpoint), then wait for a shutdown signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pg_gateway::cli::{Cli, Command};
use pg_gateway::config::Config;
use pg_gateway::error::Error;
use pg_gateway::metrics::Metrics;
use pg_gateway::primary::PrimaryState;
use pg_gateway::{discovery, gateway, metrics, net};

fn main() -> Result<(), Error> {
    init_tracing();

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command() {
        Command::Configcheck => {
            tracing::info!(?config, "configuration OK");
            println!("configuration OK");
            Ok(())
        }
        Command::Run { host, port, threads } => {
            let config = config.with_overrides(host, port, threads);
            run(config)
        }
    }
}

fn run(config: Config) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;

    let running = Arc::new(AtomicBool::new(true));
    let primary = Arc::new(PrimaryState::new());
    let metrics = Arc::new(Metrics::new());

    let (data_plane, candidates) =
        gateway::Gateway::start(&config, primary.clone(), metrics.clone(), running.clone())
            .map_err(|source| Error::ListenerBind {
                host: config.listen_host.clone(),
                port: config.listen_port.clone(),
                source,
            })?;

    let metrics_listener = bind_metrics_listener(&config.metrics_host, &config.metrics_port)
        .map_err(|source| Error::MetricsBind {
            host: config.metrics_host.clone(),
            port: config.metrics_port.clone(),
            source,
        })?;
    metrics_listener.set_nonblocking(true).map_err(Error::Io)?;

    let config = Arc::new(config);

    runtime.block_on(async {
        let metrics_listener = tokio::net::TcpListener::from_std(metrics_listener)
            .expect("failed to adopt metrics listener into tokio runtime");

        let discovery_task = tokio::spawn(discovery::run(
            config.clone(),
            candidates,
            primary.clone(),
            metrics.clone(),
            running.clone(),
        ));
        let metrics_task = tokio::spawn(metrics::serve(
            metrics_listener,
            metrics.clone(),
            running.clone(),
        ));

        wait_for_shutdown().await;
        tracing::info!("shutdown signal received");
        running.store(false, Ordering::Relaxed);

        let _ = discovery_task.await;
        let _ = metrics_task.await;
    });

    data_plane.join();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn bind_metrics_listener(host: &str, port: &str) -> std::io::Result<std::net::TcpListener> {
    let mut last_err = None;
    for addr in net::address::resolve_listen_addrs(host, port)? {
        match std::net::TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no bindable address")))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_gateway=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
