//! HTTP surface of the coordination service.
//!
//! Counters and appends are single-RTT POSTs; barriers are long-poll
//! requests that complete when the counter reaches its target;
//! subscriptions are newline-delimited JSON streams that run until the
//! client disconnects.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::store::{SyncStore, DEFAULT_IDLE_TTL};
use super::SyncApi;

#[derive(Debug, Deserialize)]
struct SignalRequest {
    run_id: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct BarrierRequest {
    run_id: String,
    state: String,
    target: u64,
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    run_id: String,
    topic: String,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    run_id: String,
    topic: String,
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    run_id: String,
    key: String,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SeqResponse {
    seq: u64,
}

/// Builds the coordination service router over a shared store.
pub fn sync_router(store: Arc<SyncStore>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/signal", post(signal))
        .route("/barrier", post(barrier))
        .route("/publish", post(publish))
        .route("/subscribe", post(subscribe))
        .route("/event", post(event))
        .route("/gc", post(gc))
        .with_state(store)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn signal(
    State(store): State<Arc<SyncStore>>,
    Json(req): Json<SignalRequest>,
) -> Result<Json<SeqResponse>, (StatusCode, String)> {
    let seq = store
        .signal_entry(&req.run_id, &req.state)
        .await
        .map_err(internal)?;
    Ok(Json(SeqResponse { seq }))
}

async fn barrier(
    State(store): State<Arc<SyncStore>>,
    Json(req): Json<BarrierRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    // Client cancellation arrives as a dropped connection, which drops
    // this future; the token exists only to satisfy the API.
    let token = CancellationToken::new();
    store
        .barrier(&req.run_id, &req.state, req.target, &token)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({})))
}

async fn publish(
    State(store): State<Arc<SyncStore>>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<SeqResponse>, (StatusCode, String)> {
    let seq = store
        .publish(&req.run_id, &req.topic, req.payload)
        .await
        .map_err(internal)?;
    Ok(Json(SeqResponse { seq }))
}

async fn subscribe(
    State(store): State<Arc<SyncStore>>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Response, (StatusCode, String)> {
    let token = CancellationToken::new();
    let rx = store
        .subscribe(&req.run_id, &req.topic, &token)
        .await
        .map_err(internal)?;

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let value = rx.recv().await?;
        let mut line = serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string());
        line.push('\n');
        Some((Ok::<Bytes, Infallible>(Bytes::from(line)), rx))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn event(
    State(store): State<Arc<SyncStore>>,
    Json(req): Json<EventRequest>,
) -> Result<Json<SeqResponse>, (StatusCode, String)> {
    let seq = store
        .signal_event(&req.run_id, &req.key, req.payload)
        .await
        .map_err(internal)?;
    Ok(Json(SeqResponse { seq }))
}

async fn gc(State(store): State<Arc<SyncStore>>) -> Json<serde_json::Value> {
    let removed = store.gc(DEFAULT_IDLE_TTL);
    Json(serde_json::json!({ "removed": removed }))
}

fn internal(err: super::SyncError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Serves the coordination service until the token fires.
pub async fn serve_sync(
    store: Arc<SyncStore>,
    listen: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "sync service listening");

    // Sweep idle cells in the background while serving.
    let gc_store = Arc::clone(&store);
    let gc_token = shutdown.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(600));
        loop {
            tokio::select! {
                _ = gc_token.cancelled() => return,
                _ = tick.tick() => {
                    gc_store.gc(DEFAULT_IDLE_TTL);
                }
            }
        }
    });

    axum::serve(listener, sync_router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
