use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: Prometheus text exposition of the extraction counters.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the workers record.
pub fn describe_metrics() {
    metrics::describe_counter!("extract_jobs_claimed_total", "Claims taken by workers");
    metrics::describe_counter!(
        "extract_jobs_completed_total",
        "Jobs whose output validated and was stored"
    );
    metrics::describe_counter!(
        "extract_attempts_failed_total",
        "Attempts that timed out, produced malformed output or hit a session fault"
    );
    metrics::describe_counter!(
        "extract_jobs_failed_total",
        "Jobs that used up their attempts"
    );
    metrics::describe_counter!(
        "extract_claims_reclaimed_total",
        "Stale claims recovered by the reconciler"
    );
    metrics::describe_histogram!(
        "extract_attempt_seconds",
        metrics::Unit::Seconds,
        "Wall time of one extraction attempt"
    );
}
