//! HTTP client for the coordination service.
//!
//! Implements [`SyncApi`] over reqwest, so instances, sidecars and tests
//! use the same trait whether they talk to the in-process store or to a
//! remote sync service.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{SyncApi, SyncError};

/// Client for a remote coordination service.
#[derive(Clone)]
pub struct SyncClient {
    endpoint: String,
    client: reqwest::Client,
}

impl SyncClient {
    /// Creates a client against `endpoint` (e.g. `http://10.0.0.1:5050`).
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn post_seq(&self, path: &str, body: serde_json::Value) -> Result<u64, SyncError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(SyncError::Transport(format!(
                "HTTP {} from {}",
                resp.status(),
                path
            )));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SyncError::Transport(format!("failed to read response: {}", e)))?;
        Ok(value.get("seq").and_then(|s| s.as_u64()).unwrap_or(0))
    }

    /// Pings the service's health endpoint.
    pub async fn healthz(&self) -> Result<(), SyncError> {
        let resp = self
            .client
            .get(self.url("/healthz"))
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::Transport(format!("HTTP {}", resp.status())))
        }
    }

    /// Asks the service to sweep idle streams and counters.
    pub async fn gc(&self) -> Result<(), SyncError> {
        let resp = self
            .client
            .post(self.url("/gc"))
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::Transport(format!("HTTP {}", resp.status())))
        }
    }
}

#[async_trait]
impl SyncApi for SyncClient {
    async fn signal_entry(&self, run_id: &str, state: &str) -> Result<u64, SyncError> {
        self.post_seq(
            "/signal",
            serde_json::json!({ "run_id": run_id, "state": state }),
        )
        .await
    }

    async fn barrier(
        &self,
        run_id: &str,
        state: &str,
        target: u64,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        if target == 0 {
            return Ok(());
        }

        let request = self
            .client
            .post(self.url("/barrier"))
            .json(&serde_json::json!({
                "run_id": run_id,
                "state": state,
                "target": target,
            }))
            .send();

        tokio::select! {
            _ = token.cancelled() => Err(SyncError::Cancelled),
            resp = request => {
                let resp = resp
                    .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(SyncError::Transport(format!("HTTP {}", resp.status())))
                }
            }
        }
    }

    async fn publish(
        &self,
        run_id: &str,
        topic: &str,
        value: serde_json::Value,
    ) -> Result<u64, SyncError> {
        self.post_seq(
            "/publish",
            serde_json::json!({ "run_id": run_id, "topic": topic, "payload": value }),
        )
        .await
    }

    async fn subscribe(
        &self,
        run_id: &str,
        topic: &str,
        token: &CancellationToken,
    ) -> Result<mpsc::Receiver<serde_json::Value>, SyncError> {
        let resp = self
            .client
            .post(self.url("/subscribe"))
            .json(&serde_json::json!({ "run_id": run_id, "topic": topic }))
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(SyncError::Transport(format!(
                "HTTP {} from /subscribe",
                resp.status()
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let token = token.clone();

        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf = BytesMut::new();
            loop {
                let chunk = tokio::select! {
                    _ = token.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { return };
                let Ok(chunk) = chunk else {
                    warn!("sync subscription stream error; closing");
                    return;
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<serde_json::Value>(line) {
                        Ok(value) => {
                            if tx.send(value).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "skipping undecodable sync entry");
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn signal_event(
        &self,
        run_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<u64, SyncError> {
        self.post_seq(
            "/event",
            serde_json::json!({ "run_id": run_id, "key": key, "payload": value }),
        )
        .await
    }

    async fn gc_expired(&self) -> Result<u64, SyncError> {
        self.gc().await?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::service::sync_router;
    use super::super::store::SyncStore;
    use super::*;
    use std::sync::Arc;

    async fn spawn_service() -> (String, CancellationToken) {
        let store = Arc::new(SyncStore::new());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move {
            axum::serve(listener, sync_router(store))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .ok();
        });
        (format!("http://{}", addr), token)
    }

    #[tokio::test]
    async fn test_client_signal_and_barrier_round_trip() {
        let (endpoint, shutdown) = spawn_service().await;
        let client = SyncClient::new(&endpoint).unwrap();
        let token = CancellationToken::new();

        let waiter = {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move { client.barrier("r1", "s", 3, &token).await })
        };

        for i in 1..=3u64 {
            assert_eq!(client.signal_entry("r1", "s").await.unwrap(), i);
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("barrier should release")
            .unwrap()
            .unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_client_publish_subscribe_round_trip() {
        let (endpoint, shutdown) = spawn_service().await;
        let client = SyncClient::new(&endpoint).unwrap();
        let token = CancellationToken::new();

        assert_eq!(
            client
                .publish("r1", "peers", serde_json::json!({"addr": "a"}))
                .await
                .unwrap(),
            1
        );

        let mut rx = client.subscribe("r1", "peers", &token).await.unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["addr"], "a");

        client
            .publish("r1", "peers", serde_json::json!({"addr": "b"}))
            .await
            .unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second["addr"], "b");

        token.cancel();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_client_healthz() {
        let (endpoint, shutdown) = spawn_service().await;
        let client = SyncClient::new(&endpoint).unwrap();
        client.healthz().await.unwrap();
        shutdown.cancel();
    }
}
