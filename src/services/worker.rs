//! One extraction worker: claim, submit, wait for the output to settle,
//! validate, record.
//!
//! A worker owns a single agent session for its lifetime and processes one
//! job at a time. Workers never talk to each other; the claim statement in
//! the job store is the only coordination between them.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::models::extraction::{ExtractionOutput, ResultRecord};
use crate::models::job::{Job, WorkerId};
use crate::services::agent::{AgentConnector, AgentError, AgentSession};
use crate::services::completion::{CompletionDetector, DetectError};
use crate::services::job_store::{ClaimScope, JobStore, StoreError};
use crate::services::output::{OutputError, OutputValidator};
use crate::services::retry::{AttemptState, RetryController, RetryDecision};
use crate::services::sink::ResultSink;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between claim attempts when nothing is eligible.
    pub idle_poll: Duration,
    /// Stop after finding nothing to claim for this long.
    pub idle_grace: Duration,
    /// Tries at opening an agent session before giving up on the run.
    pub session_connect_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(1),
            idle_grace: Duration::from_secs(30),
            session_connect_attempts: 3,
        }
    }
}

/// Everything the workers of one pool share.
pub struct WorkerContext {
    pub store: JobStore,
    pub connector: Arc<dyn AgentConnector>,
    pub detector: CompletionDetector,
    pub validator: OutputValidator,
    pub retry: RetryController,
    pub instructions: String,
    pub sink: Option<Arc<dyn ResultSink>>,
    pub config: WorkerConfig,
}

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    /// Nothing left to claim or in flight within the run's scope.
    Drained,
    /// Nothing claimable for the idle grace period.
    Idle,
}

/// Progress reported by workers to the pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Claimed {
        worker_id: WorkerId,
        job_id: String,
        attempt: u32,
    },
    Completed {
        worker_id: WorkerId,
        job_id: String,
        attempts: u32,
        elapsed: Duration,
    },
    AttemptFailed {
        worker_id: WorkerId,
        job_id: String,
        attempts: u32,
        error: String,
    },
    GaveUp {
        worker_id: WorkerId,
        job_id: String,
        attempts: u32,
    },
    ClaimLost {
        worker_id: WorkerId,
        job_id: String,
    },
    Stopped {
        worker_id: WorkerId,
        reason: StopReason,
    },
}

/// Why one attempt at a job failed. Every variant except `Cancelled` costs
/// the job an attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("Agent output did not settle within {ceiling:?} (last length {last_len})")]
    Timeout { ceiling: Duration, last_len: usize },

    #[error("Malformed output: {0}")]
    Malformed(#[from] OutputError),

    #[error("Agent session fault: {0}")]
    SessionFault(AgentError),

    #[error("Cancelled")]
    Cancelled,
}

impl AttemptError {
    /// Whether the session should be replaced before the next job.
    pub fn poisons_session(&self) -> bool {
        match self {
            AttemptError::SessionFault(AgentError::Input { .. }) => false,
            AttemptError::SessionFault(_) => true,
            _ => false,
        }
    }
}

impl From<DetectError> for AttemptError {
    fn from(e: DetectError) -> Self {
        match e {
            DetectError::Timeout { ceiling, last_len } => AttemptError::Timeout { ceiling, last_len },
            DetectError::Session(e) => AttemptError::SessionFault(e),
            DetectError::Cancelled => AttemptError::Cancelled,
        }
    }
}

/// Errors that end the worker and abort the run.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("{worker_id} could not open an agent session after {attempts} tries: {source}")]
    SessionUnavailable {
        worker_id: WorkerId,
        attempts: u32,
        #[source]
        source: AgentError,
    },
}

enum SessionHealth {
    Healthy,
    Faulted,
}

pub struct Worker {
    id: WorkerId,
    ctx: Arc<WorkerContext>,
    scope: ClaimScope,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        ctx: Arc<WorkerContext>,
        scope: ClaimScope,
        events: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            ctx,
            scope,
            events,
            cancel,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Process jobs until a stop condition is met.
    pub async fn run(self) -> Result<StopReason, WorkerError> {
        tracing::info!(worker_id = %self.id, run_id = %self.scope.run_id, "Worker started");

        let reason = self.run_loop().await?;

        tracing::info!(worker_id = %self.id, reason = %reason, "Worker stopped");
        self.emit(WorkerEvent::Stopped {
            worker_id: self.id.clone(),
            reason,
        })
        .await;
        Ok(reason)
    }

    async fn run_loop(&self) -> Result<StopReason, WorkerError> {
        let mut session: Option<Box<dyn AgentSession>> = None;
        let mut idle_since: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }

            let mut active = match session.take() {
                Some(active) => active,
                None => match self.connect().await? {
                    Some(active) => active,
                    None => return Ok(StopReason::Cancelled),
                },
            };

            let claimed = self.ctx.store.claim_next(&self.id, &self.scope).await?;
            let Some(job) = claimed else {
                session = Some(active);

                if !self.ctx.store.has_outstanding_work(&self.scope).await? {
                    return Ok(StopReason::Drained);
                }
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.ctx.config.idle_grace {
                    return Ok(StopReason::Idle);
                }

                tracing::trace!(worker_id = %self.id, "No claimable jobs, sleeping");
                if !self.pause(self.ctx.config.idle_poll).await {
                    return Ok(StopReason::Cancelled);
                }
                continue;
            };
            idle_since = None;

            match self.process(&mut *active, job).await? {
                SessionHealth::Healthy => session = Some(active),
                SessionHealth::Faulted => {
                    tracing::warn!(worker_id = %self.id, "Dropping faulted agent session");
                }
            }
        }
    }

    /// Open a session, retrying with the retry delay. `None` when cancelled.
    async fn connect(&self) -> Result<Option<Box<dyn AgentSession>>, WorkerError> {
        let attempts = self.ctx.config.session_connect_attempts.max(1);
        let mut tries = 0;

        loop {
            tries += 1;
            match self.ctx.connector.connect(&self.id).await {
                Ok(session) => {
                    tracing::info!(worker_id = %self.id, tries, "Agent session ready");
                    return Ok(Some(session));
                }
                Err(source) if tries >= attempts => {
                    return Err(WorkerError::SessionUnavailable {
                        worker_id: self.id.clone(),
                        attempts,
                        source,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        tries,
                        error = %e,
                        "Failed to open agent session, will retry"
                    );
                    if !self.pause(self.ctx.retry.policy().delay).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn process(
        &self,
        session: &mut dyn AgentSession,
        job: Job,
    ) -> Result<SessionHealth, WorkerError> {
        let attempt = match self.ctx.retry.state_after(job.attempts) {
            AttemptState::Attempt(n) => n,
            // The store admitted the claim, so its budget is the one that counts.
            AttemptState::Failed => job.attempts + 1,
        };
        tracing::info!(
            worker_id = %self.id,
            job_id = %job.id,
            input_ref = %job.input_ref,
            attempt,
            "Processing extraction job"
        );
        metrics::counter!("extract_jobs_claimed_total").increment(1);
        self.emit(WorkerEvent::Claimed {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
            attempt,
        })
        .await;

        let started = Instant::now();
        let result = self.attempt(session, &job).await;
        let elapsed = started.elapsed();
        metrics::histogram!("extract_attempt_seconds").record(elapsed.as_secs_f64());

        match result {
            Ok(output) => {
                self.record_success(&job, output, elapsed).await?;
                Ok(SessionHealth::Healthy)
            }
            Err(AttemptError::Cancelled) => {
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    "Cancelled mid-job, claim left for the reconciler"
                );
                Ok(SessionHealth::Healthy)
            }
            Err(e) => {
                let health = if e.poisons_session() {
                    SessionHealth::Faulted
                } else {
                    SessionHealth::Healthy
                };
                self.record_failure(&job, &e).await?;
                Ok(health)
            }
        }
    }

    async fn attempt(
        &self,
        session: &mut dyn AgentSession,
        job: &Job,
    ) -> Result<ExtractionOutput, AttemptError> {
        // A submission that never answers is bounded by the same ceiling
        // as the output it should produce.
        let ceiling = self.ctx.detector.config().timeout_ceiling;
        let submitted = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
            submitted = tokio::time::timeout(
                ceiling,
                session.submit(&job.input_ref, &self.ctx.instructions),
            ) => submitted,
        };
        let handle = submitted
            .map_err(|_| AttemptError::Timeout { ceiling, last_len: 0 })?
            .map_err(AttemptError::SessionFault)?;

        let done = self
            .ctx
            .detector
            .wait_for_output(&*session, handle, &self.cancel)
            .await?;

        tracing::debug!(
            worker_id = %self.id,
            job_id = %job.id,
            len = done.output.len(),
            samples = done.samples,
            elapsed_ms = done.elapsed.as_millis() as u64,
            "Agent output settled"
        );

        Ok(self.ctx.validator.validate(&done.output)?)
    }

    async fn record_success(
        &self,
        job: &Job,
        output: ExtractionOutput,
        elapsed: Duration,
    ) -> Result<(), WorkerError> {
        let attempts = match self.ctx.store.complete(&job.id, &self.id, &output.payload).await {
            Ok(attempts) => attempts,
            Err(StoreError::ClaimLost { .. }) => {
                self.claim_lost(job).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            worker_id = %self.id,
            job_id = %job.id,
            attempts,
            tables = output.table_count,
            rows = output.row_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job completed successfully"
        );
        metrics::counter!("extract_jobs_completed_total").increment(1);
        self.emit(WorkerEvent::Completed {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
            attempts,
            elapsed,
        })
        .await;

        if let Some(sink) = &self.ctx.sink {
            let record = ResultRecord {
                job_id: job.id.clone(),
                input_ref: job.input_ref.clone(),
                worker_id: self.id.clone(),
                attempts,
                extracted_at: Utc::now(),
                table_count: output.table_count,
                row_count: output.row_count,
                data: output.payload,
            };
            if let Err(e) = sink.write(&record).await {
                tracing::error!(job_id = %job.id, error = %e, "Failed to write result to sink");
            }
        }
        Ok(())
    }

    async fn record_failure(&self, job: &Job, error: &AttemptError) -> Result<(), WorkerError> {
        let outcome = match self.ctx.store.fail(&job.id, &self.id).await {
            Ok(outcome) => outcome,
            Err(StoreError::ClaimLost { .. }) => {
                self.claim_lost(job).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!("extract_attempts_failed_total").increment(1);
        self.emit(WorkerEvent::AttemptFailed {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
            attempts: outcome.attempts,
            error: error.to_string(),
        })
        .await;

        let decision = if outcome.exhausted {
            RetryDecision::GiveUp
        } else {
            self.ctx.retry.decide(outcome.attempts)
        };

        match decision {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempts = outcome.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, job returned for retry"
                );
                self.pause(delay).await;
            }
            RetryDecision::GiveUp => {
                tracing::error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempts = outcome.attempts,
                    error = %error,
                    "Job failed after max attempts"
                );
                metrics::counter!("extract_jobs_failed_total").increment(1);
                self.emit(WorkerEvent::GaveUp {
                    worker_id: self.id.clone(),
                    job_id: job.id.clone(),
                    attempts: outcome.attempts,
                })
                .await;
            }
        }
        Ok(())
    }

    async fn claim_lost(&self, job: &Job) {
        tracing::warn!(
            worker_id = %self.id,
            job_id = %job.id,
            "Claim was taken back before the outcome was recorded, discarding"
        );
        self.emit(WorkerEvent::ClaimLost {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
        })
        .await;
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        // The aggregator only goes away once the run is over.
        let _ = self.events.send(event).await;
    }
}
