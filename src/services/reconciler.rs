use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::job::ReclaimedJob;
use crate::services::job_store::{JobStore, StoreError};

/// Recovers claims left behind by workers that died mid-job.
///
/// There is no heartbeat. A claim older than `stale_after` is assumed dead
/// and counted as a failed attempt, so the threshold must be longer than any
/// attempt can legitimately run.
#[derive(Clone)]
pub struct Reconciler {
    store: JobStore,
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(store: JobStore, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub async fn run_once(&self) -> Result<Vec<ReclaimedJob>, StoreError> {
        let reclaimed = self.store.reclaim_stale(self.stale_after).await?;

        for job in &reclaimed {
            tracing::warn!(
                job_id = %job.id,
                worker_id = job.worker_id.as_ref().map(|w| w.as_str()).unwrap_or("-"),
                claimed_at = ?job.claimed_at,
                attempts = job.outcome.attempts,
                exhausted = job.outcome.exhausted,
                "Reclaimed stale claim"
            );
            if job.outcome.exhausted {
                metrics::counter!("extract_jobs_failed_total").increment(1);
            }
        }
        metrics::counter!("extract_claims_reclaimed_total").increment(reclaimed.len() as u64);

        if reclaimed.is_empty() {
            tracing::debug!(stale_after_secs = self.stale_after.as_secs(), "No stale claims");
        } else {
            tracing::info!(count = reclaimed.len(), "Stale claims recovered");
        }
        Ok(reclaimed)
    }

    /// Run every `interval` until `cancel` fires. Errors are logged and the
    /// next tick tries again.
    pub fn spawn_periodic(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup already reconciled.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "Periodic reconcile failed");
                        }
                    }
                }
            }
        })
    }
}
