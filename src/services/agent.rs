//! Interface to the external extraction agent.
//!
//! The agent is session based: a session accepts one input at a time and
//! streams its answer into a buffer that the caller polls. Nothing signals the
//! end of the stream; see [`crate::services::completion`] for how completion
//! is inferred.

use async_trait::async_trait;

use crate::models::job::WorkerId;

/// Handle to one submission on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionHandle(pub u64);

/// One stateful agent session, owned by exactly one worker.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Start processing `input_ref` with the given instructions. Any earlier
    /// submission on this session is abandoned.
    async fn submit(
        &mut self,
        input_ref: &str,
        instructions: &str,
    ) -> Result<SubmissionHandle, AgentError>;

    /// Output received so far for `handle`. Repeated calls without new output
    /// return the same text; the length never shrinks while streaming.
    async fn read_buffer(&self, handle: SubmissionHandle) -> Result<String, AgentError>;
}

/// Opens agent sessions.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, worker: &WorkerId) -> Result<Box<dyn AgentSession>, AgentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Agent returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not resolve input {input_ref}: {reason}")]
    Input { input_ref: String, reason: String },

    #[error("Output stream failed: {0}")]
    Stream(String),

    #[error("Unknown submission {0:?}")]
    UnknownSubmission(SubmissionHandle),

    #[error("Agent session closed: {0}")]
    Closed(String),
}
