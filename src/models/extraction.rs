use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::WorkerId;

/// Structurally valid output taken from a settled agent buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub payload: serde_json::Value,
    pub table_count: usize,
    pub row_count: usize,
}

/// Document written by the result sink for one successful job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: String,
    pub input_ref: String,
    pub worker_id: WorkerId,
    pub attempts: u32,
    pub extracted_at: DateTime<Utc>,
    pub table_count: usize,
    pub row_count: usize,
    pub data: serde_json::Value,
}
