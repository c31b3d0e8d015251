//! Cluster API abstraction.
//!
//! The cluster runner reaches the cluster through the [`ClusterApi`]
//! trait behind a [`ClientPool`]: a bounded semaphore gating one shared,
//! reusable HTTP handle, which caps in-flight API calls the same way a
//! fixed pool of connections would. Tests inject a mock.

mod http;

pub use http::HttpClusterApi;

#[cfg(test)]
pub use mock::MockClusterApi;

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

/// Size of the client pool guarding cluster API calls.
pub const DEFAULT_POOL_SIZE: usize = 20;

/// Errors from the cluster API.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API request failed: {0}")]
    Http(String),

    #[error("cluster API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("exec channel error: {0}")]
    Exec(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Worker node summary.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    /// Allocatable CPU in millicores.
    pub allocatable_cpu_millis: i64,
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Pod summary row.
#[derive(Debug, Clone)]
pub struct PodInfo {
    pub name: String,
    pub phase: PodPhase,
}

/// Simplified pod manifest covering what the platform schedules.
#[derive(Debug, Clone, Default)]
pub struct PodSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub env: Vec<(String, String)>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// Name of the shared persistent volume claim mounted at
    /// `mount_path`, when set.
    pub volume_claim: Option<String>,
    pub mount_path: String,
    /// When set, an init container creates this directory on the shared
    /// volume before the main container starts.
    pub init_mkdir_path: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub sysctls: BTreeMap<String, String>,
}

/// Selectors for pod listings.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListParams {
    pub fn labels(selector: impl Into<String>) -> Self {
        Self {
            label_selector: Some(selector.into()),
            field_selector: None,
        }
    }
}

/// The cluster operations the platform needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<NodeInfo>, ClusterError>;

    async fn create_pod(&self, spec: &PodSpec) -> Result<(), ClusterError>;
    async fn list_pods(&self, params: &ListParams) -> Result<Vec<PodInfo>, ClusterError>;
    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;
    async fn delete_pods_by_label(&self, label_selector: &str) -> Result<(), ClusterError>;

    /// Streams pod log lines.
    async fn pod_logs(
        &self,
        name: &str,
        follow: bool,
        tail_lines: Option<i64>,
    ) -> Result<mpsc::Receiver<String>, ClusterError>;

    /// Runs a command in a pod over the exec channel and streams its
    /// stdout.
    async fn exec_pod(
        &self,
        name: &str,
        container: &str,
        command: &[String],
    ) -> Result<mpsc::Receiver<Bytes>, ClusterError>;
}

/// Bounded semaphore gating a shared cluster API handle.
#[derive(Clone)]
pub struct ClientPool {
    api: Arc<dyn ClusterApi>,
    semaphore: Arc<Semaphore>,
}

/// Checked-out handle; the permit returns to the pool on drop.
pub struct PoolGuard {
    api: Arc<dyn ClusterApi>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Deref for PoolGuard {
    type Target = dyn ClusterApi;

    fn deref(&self) -> &Self::Target {
        self.api.as_ref()
    }
}

impl ClientPool {
    pub fn new(api: Arc<dyn ClusterApi>, size: usize) -> Self {
        Self {
            api,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    /// Waits for a free slot and returns the shared handle.
    pub async fn acquire(&self) -> PoolGuard {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("client pool semaphore closed");
        PoolGuard {
            api: Arc::clone(&self.api),
            _permit: permit,
        }
    }
}

/// Retries a transient cluster API read a bounded number of times with a
/// fixed delay between attempts.
pub async fn retry<T, F, Fut>(
    attempts: usize,
    delay: Duration,
    mut f: F,
) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClusterError>>,
{
    let mut last = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(attempt, %err, "cluster API call failed; retrying");
                last = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| ClusterError::Http("retry with zero attempts".to_string())))
}

/// Parses a CPU quantity (`"4"`, `"3800m"`) into millicores.
pub fn cpu_quantity_millis(raw: &str) -> Option<i64> {
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse().ok();
    }
    let cores: f64 = raw.parse().ok()?;
    Some((cores * 1000.0) as i64)
}
