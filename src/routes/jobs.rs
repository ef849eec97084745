use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::{ClaimRecord, Job, StatusTally};
use crate::services::job_store::StoreError;

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub total: u64,
    #[serde(flatten)]
    pub tally: StatusTally,
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub job: Job,
    pub claims: Vec<ClaimRecord>,
}

/// GET /api/v1/jobs/summary: job counts per status.
pub async fn job_summary(State(state): State<AppState>) -> Result<Json<SummaryResponse>, StatusCode> {
    let tally = state.store.tally().await.map_err(internal)?;
    Ok(Json(SummaryResponse {
        total: tally.total(),
        tally,
    }))
}

/// GET /api/v1/jobs/{job_id}: one job with its claim history.
pub async fn job_detail(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobDetailResponse>, StatusCode> {
    let job = state.store.get(&job_id).await.map_err(|e| match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        e => internal(e),
    })?;
    let claims = state.store.claim_history(&job_id).await.map_err(internal)?;

    Ok(Json(JobDetailResponse { job, claims }))
}

fn internal(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "Job store query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}
