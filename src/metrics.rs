//! Prometheus exposition of live run metrics.
//!
//! These counters mirror what the aggregator sees so a run can be watched from
//! a dashboard while it is in progress. Threshold evaluation never reads them.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "ledger_loadtest".to_string());

    // === Request Metrics ===

    pub static ref REQUEST_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_total", "Total number of requests sent to the ledger")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["kind"]  // kind: transfer, account_read
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of HTTP requests by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref REQUEST_ERRORS_BY_CATEGORY: IntCounterVec =
        IntCounterVec::new(
            Opts::new("request_errors_by_category_total", "Failed requests by error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref CONCURRENT_REQUESTS: Gauge =
        Gauge::with_opts(
            Opts::new("concurrent_requests", "Number of HTTP requests currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "HTTP request latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Scheduler Metrics ===

    pub static ref ACTIVE_VUS: IntGauge =
        IntGauge::with_opts(
            Opts::new("active_vus", "Number of virtual users currently running")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref TARGET_VUS: IntGauge =
        IntGauge::with_opts(
            Opts::new("target_vus", "Virtual user target of the current stage")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref ITERATIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("iterations_total", "Completed virtual user iterations")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();

    registry.register(Box::new(REQUEST_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(REQUEST_ERRORS_BY_CATEGORY.clone()))?;
    registry.register(Box::new(CONCURRENT_REQUESTS.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;

    registry.register(Box::new(ACTIVE_VUS.clone()))?;
    registry.register(Box::new(TARGET_VUS.clone()))?;
    registry.register(Box::new(ITERATIONS_TOTAL.clone()))?;

    Ok(())
}

/// Encodes everything in `registry` in the Prometheus text format.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = match registry.lock() {
        Ok(registry) => registry.gather(),
        Err(poisoned) => poisoned.into_inner().gather(),
    };

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# ERROR ENCODING METRICS");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "Metrics output is not valid UTF-8");
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let body = gather_metrics_string(&registry);

    let mut response = Response::new(Body::from(body));
    if let Ok(content_type) = TextEncoder::new().format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}
