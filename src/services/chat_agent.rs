use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::models::job::WorkerId;
use crate::services::agent::{AgentConnector, AgentError, AgentSession, SubmissionHandle};

/// Upper bound for requests that are not streamed: the credential check and
/// input downloads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Connector for an OpenAI-compatible chat completions endpoint with
/// streamed responses.
pub struct ChatStreamConnector {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatStreamConnector {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, AgentError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl AgentConnector for ChatStreamConnector {
    /// Opening a session checks that the endpoint accepts our credentials.
    async fn connect(&self, worker: &WorkerId) -> Result<Box<dyn AgentSession>, AgentError> {
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(worker_id = %worker, model = %self.model, "Agent session opened");

        Ok(Box::new(ChatStreamSession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            next_id: 0,
            active: None,
        }))
    }
}

#[derive(Default)]
struct StreamState {
    text: String,
    error: Option<String>,
}

struct ActiveStream {
    handle: SubmissionHandle,
    state: Arc<RwLock<StreamState>>,
    task: JoinHandle<()>,
}

/// One chat conversation; each submission is a fresh streamed request.
pub struct ChatStreamSession {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    next_id: u64,
    active: Option<ActiveStream>,
}

impl ChatStreamSession {
    async fn resolve_input(&self, input_ref: &str) -> Result<String, AgentError> {
        let input_err = |reason: String| AgentError::Input {
            input_ref: input_ref.to_string(),
            reason,
        };

        if input_ref.starts_with("http://") || input_ref.starts_with("https://") {
            let response = self
                .http
                .get(input_ref)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(input_err(format!("download returned {}", response.status())));
            }
            return Ok(response.text().await?);
        }

        let bytes = tokio::fs::read(input_ref)
            .await
            .map_err(|e| input_err(e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl AgentSession for ChatStreamSession {
    async fn submit(
        &mut self,
        input_ref: &str,
        instructions: &str,
    ) -> Result<SubmissionHandle, AgentError> {
        if let Some(previous) = self.active.take() {
            previous.task.abort();
        }

        let document = self.resolve_input(input_ref).await?;

        let request_body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "messages": [
                { "role": "system", "content": instructions },
                { "role": "user", "content": document },
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        self.next_id += 1;
        let handle = SubmissionHandle(self.next_id);
        let state = Arc::new(RwLock::new(StreamState::default()));

        let sink = state.clone();
        let mut stream = response.bytes_stream();
        let task = tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        sink.write().await.error = Some(e.to_string());
                        return;
                    }
                };
                if !apply_events(&sink, decoder.push(&bytes)).await {
                    return;
                }
            }
            apply_events(&sink, decoder.finish()).await;
        });

        self.active = Some(ActiveStream {
            handle,
            state,
            task,
        });
        Ok(handle)
    }

    async fn read_buffer(&self, handle: SubmissionHandle) -> Result<String, AgentError> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.handle == handle)
            .ok_or(AgentError::UnknownSubmission(handle))?;

        let state = active.state.read().await;
        if let Some(error) = &state.error {
            return Err(AgentError::Stream(error.clone()));
        }
        Ok(state.text.clone())
    }
}

impl Drop for ChatStreamSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

/// Append streamed text to the shared buffer. `false` once `[DONE]` is seen.
async fn apply_events(state: &RwLock<StreamState>, events: Vec<SseEvent>) -> bool {
    for event in events {
        match event {
            SseEvent::Delta(text) => state.write().await.text.push_str(&text),
            SseEvent::Done => return false,
        }
    }
    true
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Incremental decoder for `text/event-stream` chat completion chunks.
#[derive(Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            events.extend(decode_line(&line));
        }
        events
    }

    /// Decode whatever is left once the stream has ended, which may be a
    /// final line with no trailing newline.
    fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest).into_iter().collect()
    }
}

fn decode_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim_end().strip_prefix("data:")?.trim();

    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            (!text.is_empty()).then_some(SseEvent::Delta(text))
        }
        Err(e) => {
            tracing::debug!(error = %e, "Skipping undecodable stream chunk");
            None
        }
    }
}
