//! Process metrics and the Prometheus/OpenMetrics text endpoint that
//! exposes them.
//!
//! Grounded on the teacher's `stats/open_metric.rs` (a small trait
//! rendering `# HELP`/`# TYPE`/sample lines) and `stats/http_server.rs`
//! (a bare `hyper` http1 server, one task per accepted connection).

use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, warn};

/// Renders as a Prometheus exposition-format sample line.
trait OpenMetric {
    fn name(&self) -> &'static str;
    fn help(&self) -> &'static str;
    fn metric_type(&self) -> &'static str;
    fn value(&self) -> i64;

    fn render(&self) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} {ty}\n{name} {value}\n",
            name = self.name(),
            help = self.help(),
            ty = self.metric_type(),
            value = self.value()
        )
    }
}

struct Counter {
    name: &'static str,
    help: &'static str,
    value: Arc<AtomicU64>,
}

impl OpenMetric for Counter {
    fn name(&self) -> &'static str {
        self.name
    }
    fn help(&self) -> &'static str {
        self.help
    }
    fn metric_type(&self) -> &'static str {
        "counter"
    }
    fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed) as i64
    }
}

struct Gauge {
    name: &'static str,
    help: &'static str,
    value: Arc<AtomicI64>,
}

impl OpenMetric for Gauge {
    fn name(&self) -> &'static str {
        self.name
    }
    fn help(&self) -> &'static str {
        self.help
    }
    fn metric_type(&self) -> &'static str {
        "gauge"
    }
    fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide atomic counters, shared between every worker thread
/// and the metrics HTTP task.
#[derive(Debug, Default)]
pub struct Metrics {
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    bytes_client_to_backend: AtomicU64,
    bytes_backend_to_client: AtomicU64,
    servers_total: AtomicI64,
    servers_healthy: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_active_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_client_to_backend(&self, n: u64) {
        self.bytes_client_to_backend.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_backend_to_client(&self, n: u64) {
        self.bytes_backend_to_client.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_servers(&self, total: i64, healthy: i64) {
        self.servers_total.store(total, Ordering::Relaxed);
        self.servers_healthy.store(healthy, Ordering::Relaxed);
    }

    fn render(&self) -> String {
        let active = Gauge {
            name: "pg_gateway_connections_active",
            help: "Number of currently active client connections",
            value: Arc::new(AtomicI64::new(self.active_connections.load(Ordering::Relaxed))),
        };
        let total = Counter {
            name: "pg_gateway_connections_total",
            help: "Total number of client connections accepted",
            value: Arc::new(AtomicU64::new(self.total_connections.load(Ordering::Relaxed))),
        };
        let c2b = Counter {
            name: "pg_gateway_bytes_client_to_backend_total",
            help: "Total bytes relayed from clients to backends",
            value: Arc::new(AtomicU64::new(
                self.bytes_client_to_backend.load(Ordering::Relaxed),
            )),
        };
        let b2c = Counter {
            name: "pg_gateway_bytes_backend_to_client_total",
            help: "Total bytes relayed from backends to clients",
            value: Arc::new(AtomicU64::new(
                self.bytes_backend_to_client.load(Ordering::Relaxed),
            )),
        };
        let servers_total = Gauge {
            name: "pg_gateway_servers_total",
            help: "Total number of configured candidate servers",
            value: Arc::new(AtomicI64::new(self.servers_total.load(Ordering::Relaxed))),
        };
        let servers_healthy = Gauge {
            name: "pg_gateway_servers_healthy",
            help: "Number of candidate servers currently considered healthy",
            value: Arc::new(AtomicI64::new(self.servers_healthy.load(Ordering::Relaxed))),
        };
        let servers_unhealthy = Gauge {
            name: "pg_gateway_servers_unhealthy",
            help: "Number of candidate servers currently considered unhealthy",
            value: Arc::new(AtomicI64::new(
                self.servers_total.load(Ordering::Relaxed)
                    - self.servers_healthy.load(Ordering::Relaxed),
            )),
        };

        [
            active.render(),
            total.render(),
            c2b.render(),
            b2c.render(),
            servers_total.render(),
            servers_healthy.render(),
            servers_unhealthy.render(),
        ]
        .concat()
    }
}

async fn handle(
    metrics: Arc<Metrics>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/metrics") | (&hyper::Method::GET, "/") => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(metrics.render())))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    };
    Ok(response)
}

/// Serve the metrics endpoint until `running` is cleared, accepting
/// one task per connection like the teacher's `http_server.rs`.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let (stream, _) = match tokio::time::timeout(
            std::time::Duration::from_millis(500),
            listener.accept(),
        )
        .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!(error = %err, "metrics endpoint accept failed");
                continue;
            }
            Err(_) => continue, // timed out; re-check `running`.
        };

        let metrics = metrics.clone();
        tokio::task::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(metrics.clone(), req));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %err, "metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_contains_all_metric_names() {
        let metrics = Metrics::new();
        metrics.inc_active_connections();
        metrics.inc_total_connections();
        metrics.add_bytes_client_to_backend(128);
        metrics.set_servers(3, 2);

        let body = metrics.render();
        for name in [
            "pg_gateway_connections_active",
            "pg_gateway_connections_total",
            "pg_gateway_bytes_client_to_backend_total",
            "pg_gateway_bytes_backend_to_client_total",
            "pg_gateway_servers_total",
            "pg_gateway_servers_healthy",
            "pg_gateway_servers_unhealthy",
        ] {
            assert!(body.contains(name), "missing metric {name}");
        }
        assert!(body.contains("pg_gateway_connections_active 1"));
        assert!(body.contains("pg_gateway_servers_unhealthy 1"));
    }
}
