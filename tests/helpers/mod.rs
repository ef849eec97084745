//! Shared setup for the integration tests: throwaway SQLite stores and a
//! scripted in-process agent.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use extract_batch::db;
use extract_batch::models::job::{NewJob, WorkerId};
use extract_batch::services::agent::{AgentConnector, AgentError, AgentSession, SubmissionHandle};
use extract_batch::services::completion::{CompletionDetector, DetectorConfig};
use extract_batch::services::job_store::JobStore;
use extract_batch::services::output::OutputValidator;
use extract_batch::services::retry::{RetryController, RetryPolicy};
use extract_batch::services::sink::ResultSink;
use extract_batch::services::worker::{WorkerConfig, WorkerContext};

use crate::fixtures;

/// A job store on a fresh SQLite file. Keep the `TempDir` alive for the
/// duration of the test.
pub async fn temp_store(max_attempts: u32) -> (TempDir, JobStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let pool = db::init_pool(&url).await.expect("open sqlite");
    db::run_migrations(&pool).await.expect("migrations");
    (dir, JobStore::new(pool, max_attempts))
}

/// `count` jobs named `job-01`, `job-02`, ... with matching input refs.
pub fn numbered_jobs(count: usize) -> Vec<NewJob> {
    (1..=count)
        .map(|n| NewJob {
            id: format!("job-{n:02}"),
            input_ref: format!("docs/job-{n:02}.json"),
        })
        .collect()
}

/// What the scripted agent does with one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Stream a valid extraction result.
    Valid,
    /// Stream text with no result object.
    Malformed,
    /// Fail the stream after submission.
    Fault,
    /// Never produce output.
    Silent,
    /// Never return from the submission.
    Hang,
}

#[derive(Default)]
struct Script {
    /// Behaviours for the first submissions of an input; afterwards `Valid`.
    plans: HashMap<String, Vec<Behaviour>>,
    submissions: HashMap<String, u32>,
}

/// In-process agent driven by a per-input script.
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    script: Arc<Mutex<Script>>,
    connects: Arc<AtomicU32>,
    failing_connects: Arc<AtomicU32>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Play `behaviours` for the first submissions of `input_ref`.
    pub fn plan(&self, input_ref: &str, behaviours: &[Behaviour]) -> &Self {
        self.script
            .lock()
            .unwrap()
            .plans
            .insert(input_ref.to_string(), behaviours.to_vec());
        self
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: u32) -> &Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn submissions(&self, input_ref: &str) -> u32 {
        self.script
            .lock()
            .unwrap()
            .submissions
            .get(input_ref)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_submissions(&self) -> u32 {
        self.script.lock().unwrap().submissions.values().sum()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentConnector for ScriptedAgent {
    async fn connect(&self, worker: &WorkerId) -> Result<Box<dyn AgentSession>, AgentError> {
        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AgentError::Status {
                status: 503,
                body: format!("no capacity for {worker}"),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            current: None,
            next_id: 0,
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    current: Option<(SubmissionHandle, Behaviour, String)>,
    next_id: u64,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn submit(&mut self, input_ref: &str, _instructions: &str) -> Result<SubmissionHandle, AgentError> {
        let behaviour = {
            let mut script = self.script.lock().unwrap();
            let seen = script.submissions.entry(input_ref.to_string()).or_insert(0);
            let index = *seen as usize;
            *seen += 1;
            script
                .plans
                .get(input_ref)
                .and_then(|plan| plan.get(index).copied())
                .unwrap_or(Behaviour::Valid)
        };

        if behaviour == Behaviour::Hang {
            std::future::pending::<()>().await;
        }

        self.next_id += 1;
        let handle = SubmissionHandle(self.next_id);
        self.current = Some((handle, behaviour, input_ref.to_string()));
        Ok(handle)
    }

    async fn read_buffer(&self, handle: SubmissionHandle) -> Result<String, AgentError> {
        let Some((current, behaviour, input_ref)) = &self.current else {
            return Err(AgentError::UnknownSubmission(handle));
        };
        if *current != handle {
            return Err(AgentError::UnknownSubmission(handle));
        }
        match behaviour {
            Behaviour::Valid => Ok(fixtures::agent_reply(input_ref)),
            Behaviour::Malformed => Ok(fixtures::REFUSAL_REPLY.to_string()),
            Behaviour::Fault => Err(AgentError::Stream("connection reset by peer".into())),
            Behaviour::Silent | Behaviour::Hang => Ok(String::new()),
        }
    }
}

/// Timings small enough for tests that run on the real clock.
pub fn fast_detector() -> DetectorConfig {
    DetectorConfig {
        poll_interval: Duration::from_millis(5),
        stable_samples: 2,
        timeout_ceiling: Duration::from_millis(200),
        start_grace: Duration::from_millis(50),
    }
}

pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        idle_poll: Duration::from_millis(5),
        idle_grace: Duration::from_millis(300),
        session_connect_attempts: 2,
    }
}

pub fn context(
    store: &JobStore,
    agent: &ScriptedAgent,
    sink: Option<Arc<dyn ResultSink>>,
) -> WorkerContext {
    WorkerContext {
        store: store.clone(),
        connector: Arc::new(agent.clone()),
        detector: CompletionDetector::new(fast_detector()),
        validator: OutputValidator::default(),
        retry: RetryController::new(RetryPolicy {
            max_attempts: store.max_attempts(),
            delay: Duration::from_millis(10),
        }),
        instructions: "extract the tables".to_string(),
        sink,
        config: fast_worker_config(),
    }
}

/// Claim-log intervals for `job_id` in claim order: `(claimed_at, released_at)`.
pub async fn claim_intervals(store: &JobStore, job_id: &str) -> Vec<(i64, Option<i64>)> {
    sqlx::query_as::<_, (i64, Option<i64>)>(
        "SELECT claimed_at, released_at FROM claim_log WHERE job_id = ?1 ORDER BY seq",
    )
    .bind(job_id)
    .fetch_all(store.pool())
    .await
    .expect("claim log")
}

/// Move a job's claim `by` into the past.
pub async fn backdate_claim(store: &JobStore, job_id: &str, by: Duration) {
    let ms = by.as_millis() as i64;
    sqlx::query("UPDATE jobs SET claimed_at = claimed_at - ?2 WHERE id = ?1")
        .bind(job_id)
        .bind(ms)
        .execute(store.pool())
        .await
        .expect("backdate jobs");
    sqlx::query("UPDATE claim_log SET claimed_at = claimed_at - ?2 WHERE job_id = ?1 AND released_at IS NULL")
        .bind(job_id)
        .bind(ms)
        .execute(store.pool())
        .await
        .expect("backdate claim log");
}
