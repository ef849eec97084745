use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::job_store::JobStore;

/// Shared application state passed to the status API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub metrics: Arc<PrometheusHandle>,
}

impl AppState {
    pub fn new(store: JobStore, metrics: PrometheusHandle) -> Self {
        Self {
            store,
            metrics: Arc::new(metrics),
        }
    }
}
