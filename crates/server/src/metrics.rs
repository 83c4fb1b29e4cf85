//! Prometheus metrics

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;

/// Global recorder handle, installed on first use
static HANDLE: Lazy<PrometheusHandle> = Lazy::new(|| {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("install prometheus recorder")
});

/// Install the recorder once; repeated calls return the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    HANDLE.clone()
}

pub fn record_connection_opened() {
    metrics::counter!("edgevoice_connections_total").increment(1);
}

pub fn record_round_completed() {
    metrics::counter!("edgevoice_rounds_total").increment(1);
}

pub fn record_barge_in() {
    metrics::counter!("edgevoice_barge_ins_total").increment(1);
}

pub fn record_error(component: &'static str) {
    metrics::counter!("edgevoice_errors_total", "component" => component).increment(1);
}

pub fn record_tokens(count: u64) {
    metrics::counter!("edgevoice_llm_tokens_total").increment(count);
}
