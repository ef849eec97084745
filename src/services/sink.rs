use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::models::extraction::ResultRecord;

/// Destination for successful extraction results, written after the job is
/// marked `success`. The job store stays the source of truth.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write(&self, record: &ResultRecord) -> Result<(), SinkError>;
}

/// Writes one pretty-printed JSON document per job into a directory.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    /// Create the sink, creating `dir` if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SinkError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Job ids come from file stems and manifests; keep them to one path
    /// component.
    pub fn path_for(&self, job_id: &str) -> PathBuf {
        let safe: String = job_id
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '\0' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn write(&self, record: &ResultRecord) -> Result<(), SinkError> {
        let path = self.path_for(&record.job_id);
        let body = serde_json::to_vec_pretty(record)?;

        // Write to a sibling temp file first so readers never see a partial document.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|source| SinkError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(job_id = %record.job_id, path = %path.display(), "Result written");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}
