use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static STORE_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static COMPENSATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "envspot_registry_http_requests_total",
                    "Registry HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create envspot_registry_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "envspot_registry_http_request_duration_seconds",
                    "Registry HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create envspot_registry_http_request_duration_seconds"),
        )
    })
}

fn store_errors_total() -> &'static IntCounterVec {
    STORE_ERRORS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "envspot_registry_store_errors_total",
                    "Store operations that returned an error, by kind.",
                ),
                &["operation", "kind"],
            )
            .expect("create envspot_registry_store_errors_total"),
        )
    })
}

fn compensations_total() -> &'static IntCounterVec {
    COMPENSATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "envspot_registry_compensations_total",
                    "Compensating application deletes after a failed create.",
                ),
                &["outcome"],
            )
            .expect("create envspot_registry_compensations_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn inc_store_error(operation: &str, kind: &str) {
    store_errors_total()
        .with_label_values(&[operation, kind])
        .inc();
}

pub fn inc_compensation(applied: bool) {
    let outcome = if applied { "applied" } else { "failed" };
    compensations_total().with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = store_errors_total();
    let _ = compensations_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
