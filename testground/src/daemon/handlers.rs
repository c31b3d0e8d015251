//! Request handlers for the daemon surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::builder::UnpackedSources;
use crate::engine::{BuildRequest, RunRequest};
use crate::rpc::{ChannelSink, Chunk, EventSink, OutputWriter};
use crate::task::{TaskId, TaskState};

use super::App;

/// Turns a chunk receiver into a newline-delimited JSON streaming body.
fn chunk_stream(rx: mpsc::UnboundedReceiver<Chunk>) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        Some((Ok::<Bytes, Infallible>(Bytes::from(chunk.to_line())), rx))
    });
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// One-shot stream with a single terminal chunk.
fn single_chunk(chunk: Chunk) -> Response {
    let (sink, rx) = ChannelSink::new();
    sink.emit(chunk);
    chunk_stream(rx)
}

fn error_chunk(message: String) -> Response {
    single_chunk(Chunk::Error(crate::rpc::ChunkError {
        message,
        fields: Default::default(),
    }))
}

fn request_log(headers: &HeaderMap, command: &str) {
    let req_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    info!(req_id, command, "handle request");
}

/// Reads a multipart request: the first part is the JSON payload, any
/// further file parts (`plan.zip`, `sdk.zip`, `extra.zip`) are persisted
/// under the daemon work directory for the builders.
async fn consume_multipart<T: serde::de::DeserializeOwned>(
    app: &App,
    req_id: &str,
    multipart: &mut Multipart,
) -> Result<(T, Option<UnpackedSources>), String> {
    let first = multipart
        .next_field()
        .await
        .map_err(|e| format!("failed to read request: {}", e))?
        .ok_or_else(|| "empty multipart request".to_string())?;
    let payload = first
        .bytes()
        .await
        .map_err(|e| format!("failed to read request payload: {}", e))?;
    let body: T = serde_json::from_slice(&payload)
        .map_err(|e| format!("failed to decode request body: {}", e))?;

    let dir = app.engine.env().dirs().work().join("requests").join(req_id);
    let mut sources: Option<UnpackedSources> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("failed to read request part: {}", e))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let kind = filename.trim_end_matches(".zip").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| format!("failed to read {}: {}", filename, e))?;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("failed to create request directory: {}", e))?;
        let target = dir.join(&filename);
        tokio::fs::write(&target, &data)
            .await
            .map_err(|e| format!("failed to persist {}: {}", filename, e))?;

        let unpacked = sources.get_or_insert_with(|| UnpackedSources {
            base_dir: dir.clone(),
            ..Default::default()
        });
        match kind.as_str() {
            "plan" => unpacked.plan = Some(target),
            "sdk" => unpacked.sdk = Some(target),
            "extra" => unpacked.extra = Some(target),
            _ => {}
        }
    }

    Ok((body, sources))
}

pub async fn build(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    request_log(&headers, "build");
    let req_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    let (mut request, sources): (BuildRequest, _) =
        match consume_multipart(&app, &req_id, &mut multipart).await {
            Ok(parsed) => parsed,
            Err(err) => return error_chunk(err),
        };
    if request.sources.is_none() {
        request.sources = sources;
    }

    match app.engine.queue_build(request) {
        Ok(id) => single_chunk(Chunk::Result(serde_json::json!(id.as_str()))),
        Err(err) => error_chunk(format!("engine build error: {}", err)),
    }
}

pub async fn run(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    request_log(&headers, "run");
    let req_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    let (mut request, sources): (RunRequest, _) =
        match consume_multipart(&app, &req_id, &mut multipart).await {
            Ok(parsed) => parsed,
            Err(err) => return error_chunk(err),
        };
    if request.sources.is_none() {
        request.sources = sources;
    }

    match app.engine.queue_run(request) {
        Ok(id) => single_chunk(Chunk::Result(serde_json::json!(id.as_str()))),
        Err(err) => error_chunk(format!("engine run error: {}", err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct OutputsBody {
    pub runner: String,
    pub run_id: String,
}

/// Streams the raw `.tar.gz` archive of a run's outputs.
pub async fn outputs(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<OutputsBody>,
) -> Response {
    request_log(&headers, "outputs");

    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let engine = app.engine.clone();
    tokio::spawn(async move {
        let ow = OutputWriter::discard();
        if let Err(err) = engine
            .collect_outputs(&body.runner, &body.run_id, tx, &ow)
            .await
        {
            tracing::warn!(%err, "output collection failed");
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        Some((Ok::<Bytes, Infallible>(chunk), rx))
    });
    (
        [(header::CONTENT_TYPE, "application/gzip")],
        Body::from_stream(stream),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct TerminateBody {
    pub runner: String,
    #[serde(default)]
    pub builder: Option<String>,
}

pub async fn terminate(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<TerminateBody>,
) -> Response {
    request_log(&headers, "terminate");

    let (sink, rx) = ChannelSink::new();
    let ow = OutputWriter::new(Arc::new(sink));
    let engine = app.engine.clone();
    tokio::spawn(async move {
        match engine.terminate(&body.runner, &ow).await {
            Ok(()) => ow.write_result(serde_json::json!("runner terminated")),
            Err(err) => ow.write_error(&err.to_string(), &[("runner", &body.runner)]),
        }
    });
    chunk_stream(rx)
}

#[derive(Debug, Deserialize)]
pub struct HealthcheckBody {
    pub runner: String,
    #[serde(default)]
    pub fix: bool,
}

pub async fn healthcheck(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<HealthcheckBody>,
) -> Response {
    request_log(&headers, "healthcheck");

    let (sink, rx) = ChannelSink::new();
    let ow = OutputWriter::new(Arc::new(sink));
    let engine = app.engine.clone();
    tokio::spawn(async move {
        match engine.healthcheck(&body.runner, body.fix, &ow).await {
            Ok(report) => match serde_json::to_value(&report) {
                Ok(value) => ow.write_result(value),
                Err(err) => ow.write_error(&err.to_string(), &[]),
            },
            Err(err) => ow.write_error(&err.to_string(), &[("runner", &body.runner)]),
        }
    });
    chunk_stream(rx)
}

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    #[serde(default)]
    pub state: Option<String>,
    /// Inclusive lower bound on creation time (RFC 3339).
    #[serde(default)]
    pub after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time (RFC 3339).
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

pub async fn tasks(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<TasksQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    request_log(&headers, "tasks");

    let state = match query.state.as_deref() {
        None | Some("") => None,
        Some("scheduled") => Some(TaskState::Scheduled),
        Some("processing") => Some(TaskState::Processing),
        Some("complete") => Some(TaskState::Complete),
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown task state: {}", other),
            ))
        }
    };
    let start = query.after.map(|t| t.timestamp()).unwrap_or(0);
    let end = query
        .before
        .map(|t| t.timestamp())
        .unwrap_or(9_999_999_999);

    let tasks = app
        .engine
        .tasks()
        .list(state, start, end)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    serde_json::to_value(&tasks)
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub task_id: String,
    #[serde(default)]
    pub follow: bool,
}

pub async fn logs(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    request_log(&headers, "logs");

    let id = TaskId::from(query.task_id.as_str());
    match app.engine.tasks().logs(&id, query.follow) {
        Ok(rx) => chunk_stream(rx),
        Err(err) => error_chunk(err.to_string()),
    }
}

/// Spawns the daemon-side background jobs: archive retention and
/// coordination GC run on slow timers for as long as the daemon lives.
pub fn spawn_maintenance(app: Arc<App>, shutdown: CancellationToken) {
    const ARCHIVE_RETENTION_DAYS: i64 = 30;

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {
                    let cutoff = Utc::now().timestamp() - ARCHIVE_RETENTION_DAYS * 24 * 3600;
                    match app.engine.tasks().prune_archive(cutoff) {
                        Ok(0) => {}
                        Ok(n) => info!(pruned = n, "archived tasks pruned"),
                        Err(err) => tracing::warn!(%err, "archive pruning failed"),
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_query_state_parsing() {
        let q: TasksQuery = serde_json::from_str(r#"{"state":"complete"}"#).unwrap();
        assert_eq!(q.state.as_deref(), Some("complete"));

        let q: TasksQuery = serde_json::from_str(r#"{}"#).unwrap();
        assert!(q.state.is_none());
        assert!(q.after.is_none());
    }

    #[tokio::test]
    async fn test_single_chunk_stream_is_terminal_line() {
        let resp = single_chunk(Chunk::Result(serde_json::json!("task-9")));
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);

        let chunk: Chunk = serde_json::from_str(lines[0]).unwrap();
        assert!(chunk.is_terminal());
    }
}
