//! Full pipeline against a local OpenAI-compatible server that streams its
//! answer as Server-Sent Events.

mod fixtures;
mod helpers;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use extract_batch::models::job::{JobStatus, NewJob, WorkerId};
use extract_batch::services::agent::{AgentConnector, AgentError};
use extract_batch::services::chat_agent::ChatStreamConnector;
use extract_batch::services::completion::{CompletionDetector, DetectorConfig};
use extract_batch::services::output::OutputValidator;
use extract_batch::services::pool::{PoolSettings, WorkerPool};
use extract_batch::services::reconciler::Reconciler;
use extract_batch::services::retry::{RetryController, RetryPolicy};
use extract_batch::services::worker::WorkerContext;
use helpers::{fast_worker_config, temp_store};

/// Stream `text` as chat completion chunks, a few characters at a time.
fn sse_body(text: String) -> Body {
    let mut events: Vec<String> = text
        .chars()
        .collect::<Vec<_>>()
        .chunks(16)
        .map(|piece| {
            let content: String = piece.iter().collect();
            format!(
                "data: {}\n\n",
                serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
            )
        })
        .collect();
    events.push("data: [DONE]\n\n".to_string());

    let stream = futures::stream::iter(events).then(|event| async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok::<_, Infallible>(Bytes::from(event))
    });
    Body::from_stream(stream)
}

async fn chat_completions(Json(request): Json<serde_json::Value>) -> Response {
    assert_eq!(request["stream"], true);
    let document = request["messages"][1]["content"].as_str().unwrap_or_default();

    if document.contains("REFUSE") {
        return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
    }

    let first_line = document.lines().next().unwrap_or_default().to_string();
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(sse_body(fixtures::agent_reply(&first_line)))
        .unwrap()
}

async fn spawn_mock_agent() -> String {
    let app = Router::new()
        .route("/v1/models", get(|| async { Json(serde_json::json!({ "data": [] })) }))
        .route("/v1/chat/completions", post(chat_completions));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

fn detector() -> DetectorConfig {
    DetectorConfig {
        poll_interval: Duration::from_millis(50),
        stable_samples: 2,
        timeout_ceiling: Duration::from_secs(10),
        start_grace: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn test_chat_session_streams_into_buffer() {
    let base_url = spawn_mock_agent().await;
    let connector = ChatStreamConnector::new(&base_url, "test-key", "test-model").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("budget.md");
    tokio::fs::write(&input, fixtures::LIVE_DOCUMENT).await.unwrap();

    let mut session = connector.connect(&WorkerId::numbered(1)).await.unwrap();
    let handle = session
        .submit(input.to_str().unwrap(), "extract")
        .await
        .unwrap();

    let done = CompletionDetector::new(detector())
        .wait_for_output(&*session, handle, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.output, fixtures::agent_reply("Quarterly budget"));
    let parsed = OutputValidator::default().validate(&done.output).unwrap();
    assert_eq!(parsed.table_count, fixtures::REPLY_TABLES);
}

#[tokio::test]
async fn test_chat_session_reports_missing_input_and_http_errors() {
    let base_url = spawn_mock_agent().await;
    let connector = ChatStreamConnector::new(&base_url, "test-key", "test-model").unwrap();
    let mut session = connector.connect(&WorkerId::numbered(1)).await.unwrap();

    let err = session
        .submit("/definitely/not/here.pdf", "extract")
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Input { .. }));

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("refuse.txt");
    tokio::fs::write(&input, "REFUSE").await.unwrap();
    let err = session.submit(input.to_str().unwrap(), "extract").await.unwrap_err();
    assert!(matches!(err, AgentError::Status { status: 429, .. }));
}

#[tokio::test]
async fn test_pool_against_streaming_agent() {
    let base_url = spawn_mock_agent().await;
    let (dir, store) = temp_store(2).await;

    let mut jobs = Vec::new();
    for n in 1..=4 {
        let path = dir.path().join(format!("doc-{n}.md"));
        let body = if n == 3 {
            "REFUSE".to_string()
        } else {
            format!("Document {n}\n\n| a | b |\n| 1 | 2 |\n")
        };
        tokio::fs::write(&path, body).await.unwrap();
        jobs.push(NewJob {
            id: format!("doc-{n}"),
            input_ref: path.to_string_lossy().into_owned(),
        });
    }
    store.seed(&jobs).await.unwrap();

    let ctx = WorkerContext {
        store: store.clone(),
        connector: Arc::new(ChatStreamConnector::new(&base_url, "test-key", "test-model").unwrap()),
        detector: CompletionDetector::new(detector()),
        validator: OutputValidator::default(),
        retry: RetryController::new(RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(10),
        }),
        instructions: "extract the tables".to_string(),
        sink: None,
        config: fast_worker_config(),
    };
    let pool = WorkerPool::new(
        ctx,
        Reconciler::new(store.clone(), Duration::from_secs(3600)),
        PoolSettings {
            worker_count: 2,
            batch_limit: None,
            reconcile_interval: None,
        },
    );

    let report = pool.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.completed, 3);
    assert_eq!(report.gave_up, 1);
    let refused = store.get("doc-3").await.unwrap();
    assert_eq!(refused.status, JobStatus::Failed);
    assert_eq!(refused.attempts, 2);

    let done = store.get("doc-2").await.unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.attempts, 1);
    assert_eq!(
        done.result.unwrap()["extracted_tables"][0]["table_data"][0]["Item"],
        "70-Impostos"
    );
}
