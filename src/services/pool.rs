use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::models::job::WorkerId;
use crate::services::job_store::{ClaimScope, StoreError};
use crate::services::reconciler::Reconciler;
use crate::services::worker::{Worker, WorkerContext, WorkerError, WorkerEvent};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub worker_count: usize,
    /// Maximum number of distinct jobs one run may claim.
    pub batch_limit: Option<u32>,
    /// Re-run the reconciler on this interval while the pool is up.
    pub reconcile_interval: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: 2,
            batch_limit: None,
            reconcile_interval: None,
        }
    }
}

/// Totals for one pool run, built from worker events by a single task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub reclaimed_at_start: usize,
    pub claims: u64,
    pub completed: u64,
    pub attempts_failed: u64,
    pub gave_up: u64,
    pub claims_lost: u64,
    /// Distinct jobs touched by this run.
    pub jobs: usize,
    pub stopped: BTreeMap<String, String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunReport {
    fn apply(&mut self, event: &WorkerEvent, seen: &mut HashSet<String>) {
        match event {
            WorkerEvent::Claimed { job_id, .. } => {
                self.claims += 1;
                if seen.insert(job_id.clone()) {
                    self.jobs += 1;
                }
            }
            WorkerEvent::Completed { .. } => self.completed += 1,
            WorkerEvent::AttemptFailed { .. } => self.attempts_failed += 1,
            WorkerEvent::GaveUp { .. } => self.gave_up += 1,
            WorkerEvent::ClaimLost { .. } => self.claims_lost += 1,
            WorkerEvent::Stopped { worker_id, reason } => {
                self.stopped.insert(worker_id.to_string(), reason.to_string());
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Worker task panicked or was aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fixed set of workers sharing one job store and one run scope.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    reconciler: Reconciler,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, reconciler: Reconciler, settings: PoolSettings) -> Self {
        Self {
            ctx: Arc::new(ctx),
            reconciler,
            settings,
        }
    }

    /// Reconcile, then run all workers until they stop.
    ///
    /// A fatal error in any worker cancels the rest and is returned once
    /// they have wound down. Everything already committed stays in the store.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, PoolError> {
        let started = Instant::now();
        let scope = ClaimScope::new(self.settings.batch_limit);

        let reclaimed = self.reconciler.run_once().await?;

        tracing::info!(
            run_id = %scope.run_id,
            workers = self.settings.worker_count,
            batch_limit = ?scope.batch_limit,
            reclaimed = reclaimed.len(),
            "Starting worker pool"
        );

        let run_cancel = cancel.child_token();
        let periodic = self
            .settings
            .reconcile_interval
            .map(|interval| self.reconciler.clone().spawn_periodic(interval, run_cancel.clone()));

        let (tx, mut rx) = mpsc::channel::<WorkerEvent>(256);
        let mut report = RunReport {
            run_id: scope.run_id.clone(),
            reclaimed_at_start: reclaimed.len(),
            ..RunReport::default()
        };
        let aggregator = tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(event) = rx.recv().await {
                tracing::trace!(event = ?event, "Worker event");
                report.apply(&event, &mut seen);
            }
            report
        });

        let mut workers = JoinSet::new();
        for n in 1..=self.settings.worker_count.max(1) {
            let worker = Worker::new(
                WorkerId::for_run(n, &scope.run_id),
                self.ctx.clone(),
                scope.clone(),
                tx.clone(),
                run_cancel.clone(),
            );
            workers.spawn(worker.run());
        }
        drop(tx);

        let mut fatal: Option<PoolError> = None;
        while let Some(joined) = workers.join_next().await {
            let err = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => PoolError::Worker(e),
                Err(e) => PoolError::Join(e),
            };

            tracing::error!(error = %err, "Worker failed, cancelling the pool");
            run_cancel.cancel();
            fatal.get_or_insert(err);
        }

        run_cancel.cancel();
        if let Some(handle) = periodic {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Periodic reconciler did not shut down cleanly");
            }
        }

        let mut report = aggregator.await?;
        report.elapsed = started.elapsed();

        if let Some(err) = fatal {
            return Err(err);
        }

        tracing::info!(
            run_id = %report.run_id,
            jobs = report.jobs,
            completed = report.completed,
            attempts_failed = report.attempts_failed,
            gave_up = report.gave_up,
            elapsed_secs = report.elapsed.as_secs(),
            "Worker pool finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::worker::StopReason;

    #[test]
    fn test_report_counts_distinct_jobs_and_claims() {
        let w1 = WorkerId::numbered(1);
        let w2 = WorkerId::numbered(2);
        let events = vec![
            WorkerEvent::Claimed { worker_id: w1.clone(), job_id: "a".into(), attempt: 1 },
            WorkerEvent::AttemptFailed {
                worker_id: w1.clone(),
                job_id: "a".into(),
                attempts: 1,
                error: "timeout".into(),
            },
            WorkerEvent::Claimed { worker_id: w2.clone(), job_id: "a".into(), attempt: 2 },
            WorkerEvent::Completed {
                worker_id: w2.clone(),
                job_id: "a".into(),
                attempts: 2,
                elapsed: Duration::from_secs(4),
            },
            WorkerEvent::Claimed { worker_id: w1.clone(), job_id: "b".into(), attempt: 1 },
            WorkerEvent::ClaimLost { worker_id: w1.clone(), job_id: "b".into() },
            WorkerEvent::Stopped { worker_id: w1, reason: StopReason::Drained },
            WorkerEvent::Stopped { worker_id: w2, reason: StopReason::Idle },
        ];

        let mut report = RunReport::default();
        let mut seen = HashSet::new();
        for event in &events {
            report.apply(event, &mut seen);
        }

        assert_eq!(report.claims, 3);
        assert_eq!(report.jobs, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.attempts_failed, 1);
        assert_eq!(report.claims_lost, 1);
        assert_eq!(report.stopped.get("worker-1").map(String::as_str), Some("drained"));
        assert_eq!(report.stopped.get("worker-2").map(String::as_str), Some("idle"));
    }
}
