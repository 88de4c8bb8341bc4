//! Metrics and tracing setup for the cell storage service.
//!
//! Provides a global [`CellMetrics`] singleton backed by the `prometheus`
//! crate, plus a small HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<CellMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static CellMetrics {
    METRICS.get_or_init(CellMetrics::new)
}

pub struct CellMetrics {
    pub registry: Registry,

    // ── Batches ──
    pub batches: IntCounter,
    pub batches_rejected: IntCounterVec,
    pub sub_requests: IntCounterVec,
    pub sub_request_latency_secs: HistogramVec,

    // ── Cell storage ──
    pub coherency_failures: IntCounter,
    pub index_commits: IntCounter,
    pub elements_stored: IntCounter,
    pub elements_reclaimed: IntCounter,

    // ── Locks ──
    pub locks_granted: IntCounterVec,
    pub lock_expirations: IntCounter,
    pub open_files: IntGauge,
}

// prometheus types don't derive Debug.
impl std::fmt::Debug for CellMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for sub-request latency.
const LATENCY_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("counter registered once");
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts");
    registry
        .register(Box::new(c.clone()))
        .expect("counter vec registered once");
    c
}

impl CellMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let batches = counter(&registry, "cellstore_batches_total", "Batches received");
        let batches_rejected = counter_vec(
            &registry,
            "cellstore_batches_rejected_total",
            "Batches rejected before dispatch, by reason",
            &["reason"],
        );
        let sub_requests = counter_vec(
            &registry,
            "cellstore_sub_requests_total",
            "Sub-requests processed, by kind and outcome",
            &["kind", "outcome"],
        );

        let sub_request_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "cellstore_sub_request_latency_seconds",
                "Sub-request latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["kind"],
        )
        .expect("sub_request_latency_secs histogram");
        registry
            .register(Box::new(sub_request_latency_secs.clone()))
            .expect("register sub_request_latency_secs");

        let coherency_failures = counter(
            &registry,
            "cellstore_coherency_failures_total",
            "Put changes rejected with a coherency failure",
        );
        let index_commits = counter(
            &registry,
            "cellstore_index_commits_total",
            "Storage index versions committed",
        );
        let elements_stored = counter(
            &registry,
            "cellstore_elements_stored_total",
            "Data elements newly written",
        );
        let elements_reclaimed = counter(
            &registry,
            "cellstore_elements_reclaimed_total",
            "Unreachable data elements reclaimed",
        );

        let locks_granted = counter_vec(
            &registry,
            "cellstore_locks_granted_total",
            "Lock grants, by lock type",
            &["lock_type"],
        );
        let lock_expirations = counter(
            &registry,
            "cellstore_lock_expirations_total",
            "Exclusive locks and shared members dropped on expiry",
        );

        let open_files = IntGauge::with_opts(Opts::new(
            "cellstore_open_files",
            "Files with in-memory lock or partial put state",
        ))
        .expect("open_files gauge");
        registry
            .register(Box::new(open_files.clone()))
            .expect("register open_files");

        Self {
            registry,
            batches,
            batches_rejected,
            sub_requests,
            sub_request_latency_secs,
            coherency_failures,
            index_commits,
            elements_stored,
            elements_reclaimed,
            locks_granted,
            lock_expirations,
            open_files,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metrics().registry.gather(), &mut buf) {
        tracing::warn!("prometheus text encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start a sub-request latency timer. Records elapsed time on drop.
pub fn start_sub_request_timer(kind: &str) -> prometheus::HistogramTimer {
    metrics()
        .sub_request_latency_secs
        .with_label_values(&[kind])
        .start_timer()
}

/// Count one finished sub-request.
pub fn record_sub_request(kind: &str, outcome: &str) {
    metrics()
        .sub_requests
        .with_label_values(&[kind, outcome])
        .inc();
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"not found")));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }
    let mut resp = Response::new(Full::new(Bytes::from(encode_metrics())));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(resp)
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Runs until the listener fails. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
