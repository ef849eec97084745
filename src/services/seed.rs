use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::job::NewJob;

/// Jobs for every file in `dir` with the given extension (case-insensitive),
/// ordered by file name. The file stem becomes the job id.
pub async fn jobs_from_dir(dir: &Path, extension: &str) -> Result<Vec<NewJob>, SeedError> {
    let io_err = |source| SeedError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let wanted = extension.trim_start_matches('.').to_ascii_lowercase();

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.to_ascii_lowercase() == wanted);
        if matches && entry.file_type().await.map_err(io_err)?.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let jobs = paths
        .into_iter()
        .filter_map(|path| {
            let id = path.file_stem()?.to_str()?.to_string();
            let input_ref = std::path::absolute(&path).unwrap_or(path);
            Some(NewJob {
                id,
                input_ref: input_ref.to_string_lossy().into_owned(),
            })
        })
        .collect::<Vec<_>>();

    check_unique(&jobs)?;
    tracing::debug!(dir = %dir.display(), count = jobs.len(), "Collected jobs from directory");
    Ok(jobs)
}

/// Jobs from a JSON manifest: `[{"id": "...", "input_ref": "..."}, ...]`.
/// Manifest order is creation order.
pub async fn jobs_from_manifest(path: &Path) -> Result<Vec<NewJob>, SeedError> {
    let body = tokio::fs::read(path).await.map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let jobs: Vec<NewJob> = serde_json::from_slice(&body)?;

    if let Some(job) = jobs.iter().find(|j| j.id.trim().is_empty() || j.input_ref.trim().is_empty()) {
        return Err(SeedError::EmptyField(job.id.clone()));
    }
    check_unique(&jobs)?;
    Ok(jobs)
}

fn check_unique(jobs: &[NewJob]) -> Result<(), SeedError> {
    let mut seen = HashSet::new();
    match jobs.iter().find(|j| !seen.insert(j.id.as_str())) {
        Some(dup) => Err(SeedError::DuplicateId(dup.id.clone())),
        None => Ok(()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    #[error("Manifest entry {0:?} has an empty id or input_ref")]
    EmptyField(String),
}
