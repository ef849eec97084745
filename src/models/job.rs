use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Identifier of one worker (and therefore of one agent session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Plain numbered ids: `worker-1`, `worker-2`, ...
    pub fn numbered(n: usize) -> Self {
        Self(format!("worker-{n}"))
    }

    /// Ids handed out by the pool, unique per run: `worker-1-3f2a9c1e`.
    ///
    /// A worker from an earlier run can never pass the claim check for a
    /// job re-claimed by the same slot in a later run.
    pub fn for_run(n: usize, run_id: &str) -> Self {
        let short = run_id.get(..8).unwrap_or(run_id);
        Self(format!("worker-{n}-{short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusKind {
    Unclaimed,
    Claimed,
    Success,
    Failed,
}

/// Status of an extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Unclaimed,
    Claimed { worker_id: WorkerId },
    Success,
    Failed,
}

impl JobStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            JobStatus::Unclaimed => StatusKind::Unclaimed,
            JobStatus::Claimed { .. } => StatusKind::Claimed,
            JobStatus::Success => StatusKind::Success,
            JobStatus::Failed => StatusKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    pub fn is_claimed_by(&self, worker: &WorkerId) -> bool {
        matches!(self, JobStatus::Claimed { worker_id } if worker_id == worker)
    }
}

/// One document's extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub input_ref: String,
    pub status: JobStatus,
    pub attempts: u32,
    /// Current or last worker to hold the claim.
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
}

/// A job to be seeded into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub input_ref: String,
}

/// Where a job ended up after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailOutcome {
    pub attempts: u32,
    /// `true` when the job went to terminal `failed`.
    pub exhausted: bool,
}

/// A claim taken back by the reconciler.
#[derive(Debug, Clone, Serialize)]
pub struct ReclaimedJob {
    pub id: String,
    pub worker_id: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub outcome: FailOutcome,
}

/// Count of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTally {
    pub unclaimed: u64,
    pub claimed: u64,
    pub success: u64,
    pub failed: u64,
}

impl StatusTally {
    pub fn total(&self) -> u64 {
        self.unclaimed + self.claimed + self.success + self.failed
    }

    pub fn add(&mut self, kind: StatusKind, count: u64) {
        match kind {
            StatusKind::Unclaimed => self.unclaimed += count,
            StatusKind::Claimed => self.claimed += count,
            StatusKind::Success => self.success += count,
            StatusKind::Failed => self.failed += count,
        }
    }
}

/// Outcome recorded when a claim-log entry is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClaimOutcome {
    Success,
    Retry,
    Failed,
    Reclaimed,
}

/// One row of the claim log.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimRecord {
    pub job_id: String,
    pub worker_id: WorkerId,
    pub run_id: String,
    pub claimed_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub outcome: Option<ClaimOutcome>,
}
