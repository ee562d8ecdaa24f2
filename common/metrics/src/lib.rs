use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const METRIC_STATUS_CODES: &str = "http_status_codes_total";

/// Installs the global Prometheus recorder. Fails if a recorder is already installed.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
/// Someday tower-http might provide a metrics middleware: https://github.com/tower-rs/tower-http/issues/57
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    // Run the rest of the request handling first, so we can measure it and get response
    // codes.
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

struct StatusCounter {
    local: AtomicU64,
    exported: metrics::Counter,
}

/// Response counts per status code for one endpoint.
///
/// Counters are created lazily, the first time a status is seen. Concurrent requests that
/// race on a new status share the single counter that wins the insert.
#[derive(Clone)]
pub struct StatusCodeCounters {
    basename: Arc<str>,
    counters: Arc<DashMap<u16, Arc<StatusCounter>>>,
}

impl StatusCodeCounters {
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: Arc::from(basename.into()),
            counters: Default::default(),
        }
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn record(&self, status: StatusCode) {
        let counter = self
            .counters
            .entry(status.as_u16())
            .or_insert_with(|| {
                let labels = [
                    ("endpoint", self.basename.to_string()),
                    ("status", status.as_u16().to_string()),
                ];
                Arc::new(StatusCounter {
                    local: AtomicU64::new(0),
                    exported: metrics::counter!(METRIC_STATUS_CODES, &labels),
                })
            })
            .clone();

        counter.local.fetch_add(1, Ordering::Relaxed);
        counter.exported.increment(1);
    }

    /// Number of responses recorded with `status` so far.
    pub fn count(&self, status: StatusCode) -> u64 {
        self.counters
            .get(&status.as_u16())
            .map(|c| c.local.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    /// Number of distinct status codes seen so far.
    pub fn distinct(&self) -> usize {
        self.counters.len()
    }
}

/// Middleware recording the status of every response into the endpoint's counters.
/// Install with `axum::middleware::from_fn_with_state(counters, track_status_codes)`.
pub async fn track_status_codes(
    State(counters): State<StatusCodeCounters>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let response = next.run(req).await;
    counters.record(response.status());
    response
}
