//! Prometheus metrics instrumentation.
//!
//! # Metrics
//!
//! ## Counters
//! - `apiary_http_requests_total` - HTTP requests by method, endpoint, status
//! - `apiary_messages_processed_total` - Messages processed by tenant and outcome
//!
//! ## Gauges
//! - `apiary_active_tenants` - Tenants with a live runtime in this process
//!
//! ## Histograms
//! - `apiary_http_request_duration_seconds` - HTTP request latency

use prometheus::{
    CounterVec, HistogramVec, IntGauge, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for apiary metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for HTTP requests.
///
/// Labels:
/// - `method`: HTTP method
/// - `endpoint`: matched route pattern
/// - `status`: response status code
pub static HTTP_REQUESTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "apiary_http_requests_total",
        "Total number of HTTP requests",
    );
    CounterVec::new(opts, &["method", "endpoint", "status"])
        .expect("apiary_http_requests_total metric creation failed")
});

/// Histogram for HTTP request latency in seconds.
pub static HTTP_REQUEST_DURATION_SECONDS: LazyLock<HistogramVec> =
    LazyLock::new(|| {
        let opts = prometheus::HistogramOpts::new(
            "apiary_http_request_duration_seconds",
            "Duration of HTTP requests in seconds",
        );
        HistogramVec::new(opts, &["method", "endpoint"])
            .expect("apiary_http_request_duration_seconds creation failed")
    });

/// Gauge for tenants with a live runtime in this process.
pub static ACTIVE_TENANTS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "apiary_active_tenants",
        "Number of tenants with a live runtime",
    )
    .expect("apiary_active_tenants metric creation failed")
});

/// Counter for processed messages.
///
/// Labels:
/// - `tenant_id`: the tenant the message belonged to
/// - `outcome`: ok, failed, or dead_lettered
pub static MESSAGES_PROCESSED_TOTAL: LazyLock<CounterVec> =
    LazyLock::new(|| {
        let opts = Opts::new(
            "apiary_messages_processed_total",
            "Total number of messages processed",
        );
        CounterVec::new(opts, &["tenant_id", "outcome"])
            .expect("apiary_messages_processed_total creation failed")
    });

/// Register all metrics with the global registry.
///
/// Idempotent; duplicate registration attempts are ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(HTTP_REQUESTS_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
        Box::new(ACTIVE_TENANTS.clone()),
        Box::new(MESSAGES_PROCESSED_TOTAL.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg
                .contains("Duplicate metrics collector registration attempted")
            {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Record an HTTP request observation.
pub fn record_http_request(
    method: &str,
    endpoint: &str,
    status: u16,
    duration_secs: f64,
) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, endpoint])
        .observe(duration_secs);
}

/// Increment the active-tenants gauge.
pub fn inc_active_tenants() {
    ACTIVE_TENANTS.inc();
}

/// Decrement the active-tenants gauge.
pub fn dec_active_tenants() {
    ACTIVE_TENANTS.dec();
}

/// Record one processed message for a tenant.
pub fn record_message_processed(tenant_id: &str, outcome: &str) {
    MESSAGES_PROCESSED_TOTAL
        .with_label_values(&[tenant_id, outcome])
        .inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
