//! Prometheus metrics exposition
//!
//! - `oidc_authentications_total` (counter): label `outcome`
//!   (`authenticated`, `redirect`, `failed`)
//! - `oidc_errors_total` (counter): label `kind`
//! - `oidc_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "oidc_request_duration_seconds";

/// Provider round trips dominate; buckets span 5ms to 60s (the default HTTP
/// timeout).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the global recorder and return a handle for `/metrics`.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

pub fn record_authentication(outcome: &'static str) {
    metrics::counter!("oidc_authentications_total", "outcome" => outcome).increment(1);
}

pub fn record_error(kind: &'static str) {
    metrics::counter!("oidc_errors_total", "kind" => kind).increment(1);
}

pub fn record_duration(route: &'static str, duration_secs: f64) {
    metrics::histogram!(DURATION_METRIC, "route" => route).record(duration_secs);
}
