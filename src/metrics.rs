use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};

static REQUEST_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        HistogramOpts::new(
            "request_duration_milliseconds",
            "Time from accepting a query to writing its reply"
        ),
        &["client_proto", "upstream_proto", "upstream_from"]
    )
    .expect("failed to register request_duration_milliseconds")
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "prx_dns_upstream_errors_total",
        "Upstream exchange errors grouped by zone/host/stage",
        &["upstream_from", "upstream", "stage"]
    )
    .expect("failed to register prx_dns_upstream_errors_total")
});

static UPSTREAM_DOWN: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "prx_dns_upstream_down",
        "Current Down() state of an upstream host (1=down, 0=up)",
        &["upstream_from", "upstream"]
    )
    .expect("failed to register prx_dns_upstream_down")
});

pub fn observe_request_duration(client_proto: &str, upstream_proto: &str, upstream_from: &str, millis: f64) {
    REQUEST_DURATION_MS
        .with_label_values(&[client_proto, upstream_proto, upstream_from])
        .observe(millis);
}

pub fn inc_upstream_error(upstream_from: &str, upstream: &str, stage: &str) {
    UPSTREAM_ERRORS_TOTAL
        .with_label_values(&[upstream_from, upstream, stage])
        .inc();
}

pub fn set_upstream_down(upstream_from: &str, upstream: &str, down: bool) {
    UPSTREAM_DOWN
        .with_label_values(&[upstream_from, upstream])
        .set(if down { 1 } else { 0 });
}

/// Renders the process registry in Prometheus text exposition format for
/// the `/metrics` axum handler.
pub fn gather_text() -> anyhow::Result<String> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
