pub mod health;
pub mod jobs;
pub mod metrics;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Read-only status API over the job store.
pub fn router(state: AppState) -> Router {
    let prometheus = state.metrics.clone();

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs/summary", get(jobs::job_summary))
        .route("/api/v1/jobs/{job_id}", get(jobs::job_detail))
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
