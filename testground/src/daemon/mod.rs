//! Daemon HTTP surface.
//!
//! JSON in, newline-delimited chunk stream out. Long-running endpoints
//! stream progress chunks and end with exactly one result or error
//! chunk, so clients that disconnect mid-stream can still parse every
//! complete line they received. Every request carries an `X-Request-ID`;
//! the daemon assigns one when absent.

mod handlers;

pub use handlers::spawn_maintenance;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::sync::sync_router;

/// Shared daemon state.
pub struct App {
    pub engine: Engine,
}

/// Builds the daemon router:
///
/// | Method | Path         | Purpose                               |
/// |--------|--------------|---------------------------------------|
/// | POST   | /build       | queue a build, returns task id        |
/// | POST   | /run         | queue a run, returns task id          |
/// | POST   | /outputs     | stream a run's output archive         |
/// | POST   | /terminate   | tear down a runner's infrastructure   |
/// | POST   | /healthcheck | run a runner's healthcheck            |
/// | GET    | /tasks       | list tasks                            |
/// | GET    | /logs        | stream a task's event log             |
///
/// The coordination service is mounted under `/sync`.
pub fn router(app: Arc<App>) -> Router {
    let sync = sync_router(app.engine.sync_store());
    Router::new()
        .route("/build", post(handlers::build))
        .route("/run", post(handlers::run))
        .route("/outputs", post(handlers::outputs))
        .route("/terminate", post(handlers::terminate))
        .route("/healthcheck", post(handlers::healthcheck))
        .route("/tasks", get(handlers::tasks))
        .route("/logs", get(handlers::logs))
        .with_state(app)
        .nest("/sync", sync)
        .layer(middleware::from_fn(request_id))
}

/// Assigns an `X-Request-ID` when the client did not send one, and
/// mirrors it onto the response.
async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert("x-request-id", value.clone());
        let mut resp = next.run(req).await;
        resp.headers_mut().insert("x-request-id", value);
        resp
    } else {
        next.run(req).await
    }
}

/// Serves the daemon until the token fires.
pub async fn serve(
    app: Arc<App>,
    listen: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "daemon listening");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
