use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{
    ClaimRecord, FailOutcome, Job, NewJob, ReclaimedJob, StatusKind, StatusTally, WorkerId,
};

/// Which jobs a pool run may claim.
#[derive(Debug, Clone)]
pub struct ClaimScope {
    pub run_id: String,
    /// Maximum number of distinct jobs this run may claim.
    pub batch_limit: Option<u32>,
}

impl ClaimScope {
    pub fn new(batch_limit: Option<u32>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            batch_limit,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }
}

/// Persistent job store shared by all workers.
///
/// Every status transition is a single compare-and-swap statement against
/// SQLite, so workers need no other coordination.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    max_attempts: u32,
}

impl JobStore {
    pub fn new(pool: SqlitePool, max_attempts: u32) -> Self {
        Self { pool, max_attempts }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Insert jobs that are not already present. Returns how many were new.
    pub async fn seed(&self, jobs: &[NewJob]) -> Result<u64, StoreError> {
        Ok(queries::insert_jobs(&self.pool, jobs, Utc::now()).await?)
    }

    /// Claim the next eligible job: fresh work first, then retryable
    /// failures, each in creation order.
    pub async fn claim_next(
        &self,
        worker: &WorkerId,
        scope: &ClaimScope,
    ) -> Result<Option<Job>, StoreError> {
        Ok(queries::claim_next(
            &self.pool,
            worker,
            &scope.run_id,
            scope.batch_limit,
            self.max_attempts,
            Utc::now(),
        )
        .await?)
    }

    /// Mark a claimed job successful and store its result.
    pub async fn complete(
        &self,
        job_id: &str,
        worker: &WorkerId,
        result: &serde_json::Value,
    ) -> Result<u32, StoreError> {
        queries::complete_job(&self.pool, job_id, worker, result, Utc::now())
            .await?
            .ok_or_else(|| StoreError::ClaimLost {
                job_id: job_id.to_string(),
                worker_id: worker.clone(),
            })
    }

    /// Record a failed attempt on a claimed job.
    pub async fn fail(&self, job_id: &str, worker: &WorkerId) -> Result<FailOutcome, StoreError> {
        queries::fail_job(&self.pool, job_id, worker, self.max_attempts, Utc::now())
            .await?
            .ok_or_else(|| StoreError::ClaimLost {
                job_id: job_id.to_string(),
                worker_id: worker.clone(),
            })
    }

    /// Treat every claim older than `older_than` as a failed attempt.
    pub async fn reclaim_stale(&self, older_than: Duration) -> Result<Vec<ReclaimedJob>, StoreError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(queries::reclaim_stale(&self.pool, cutoff, self.max_attempts, now).await?)
    }

    /// Whether `scope` still has jobs to claim or jobs in flight.
    pub async fn has_outstanding_work(&self, scope: &ClaimScope) -> Result<bool, StoreError> {
        Ok(queries::has_outstanding_work(
            &self.pool,
            &scope.run_id,
            scope.batch_limit,
            self.max_attempts,
        )
        .await?)
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        queries::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    pub async fn list(&self, status: Option<StatusKind>, limit: i64) -> Result<Vec<Job>, StoreError> {
        Ok(queries::list_jobs(&self.pool, status, limit).await?)
    }

    pub async fn tally(&self) -> Result<StatusTally, StoreError> {
        Ok(queries::status_tally(&self.pool).await?)
    }

    /// Operator action: make one job eligible again with a fresh attempt
    /// budget. Claimed jobs are refused.
    pub async fn reset_job(&self, job_id: &str) -> Result<(), StoreError> {
        if queries::reset_job(&self.pool, job_id, Utc::now()).await? {
            return Ok(());
        }
        match self.get(job_id).await?.status.kind() {
            StatusKind::Claimed => Err(StoreError::StillClaimed(job_id.to_string())),
            _ => Err(StoreError::NotFound(job_id.to_string())),
        }
    }

    /// Operator action: reset every terminally failed job.
    pub async fn reset_failed(&self) -> Result<u64, StoreError> {
        Ok(queries::reset_failed(&self.pool, Utc::now()).await?)
    }

    pub async fn claim_history(&self, job_id: &str) -> Result<Vec<ClaimRecord>, StoreError> {
        Ok(queries::claim_history(&self.pool, job_id).await?)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        Ok(queries::ping(&self.pool).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {job_id} is no longer claimed by {worker_id}")]
    ClaimLost { job_id: String, worker_id: WorkerId },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} is claimed by a worker and cannot be reset")]
    StillClaimed(String),
}
