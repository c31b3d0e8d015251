//! Runner abstraction and its realizations.
//!
//! A runner takes a test plan in executable form — an opaque artifact
//! handle produced by a builder — and schedules a run of a test case
//! across many instances. Three realizations ship here:
//!
//! - [`ProcessRunner`] (`local:exec`): parallel child processes
//! - [`ContainerRunner`] (`local:docker`): containers on a local daemon
//! - [`ClusterRunner`] (`cluster:k8s`): pods on a remote cluster
//!
//! Runner configuration is a closed set of tagged variants decoded by
//! runner name; there is no dynamic typing anywhere on this path.

mod cluster;
mod container;
mod logs;
pub mod params;
mod process;
mod subnet;

pub use cluster::{ClusterRunner, ClusterRunnerCfg};
pub use container::{ContainerRunner, ContainerRunnerCfg};
pub use logs::LogMultiplexer;
pub use params::RunParams;
pub use process::{ProcessRunner, ProcessRunnerCfg};
pub use subnet::{control_gateway, control_subnet, ip_in_data_subnet, DataSubnets};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::composition::Resources;
use crate::healthcheck::HealthcheckReport;
use crate::rpc::OutputWriter;
use crate::sync::SyncError;

/// Errors surfaced by runners.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unknown runner: {0}")]
    UnknownRunner(String),

    #[error("runner {runner} received config for a different runner")]
    ConfigMismatch { runner: &'static str },

    #[error("invalid runner config: {0}")]
    InvalidConfig(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("{failed} of {total} instances exited with a non-zero code")]
    InstancesFailed { failed: usize, total: usize },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("operation not supported by this runner")]
    Unsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// One group expanded for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunGroup {
    pub id: String,
    /// Resolved number of instances for this group.
    pub instances: u32,
    /// Builder-produced artifact: an executable path or an image
    /// reference, depending on the runner.
    pub artifact: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
}

/// Everything a runner needs to execute one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInput {
    pub run_id: String,
    pub plan: String,
    pub case: String,
    pub total_instances: u32,
    pub groups: Vec<RunGroup>,
    pub config: RunnerConfig,
}

/// Terminal value of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id: String,
}

/// Input for output collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInput {
    pub run_id: String,
    pub runner: String,
}

/// Closed set of runner configurations, decoded by runner name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "runner", rename_all = "snake_case")]
pub enum RunnerConfig {
    Process(ProcessRunnerCfg),
    Container(ContainerRunnerCfg),
    Cluster(ClusterRunnerCfg),
}

impl RunnerConfig {
    /// Decodes the config map from a composition for the named runner.
    pub fn decode(
        runner_id: &str,
        raw: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, RunnerError> {
        let value = serde_json::Value::Object(raw.clone().into_iter().collect());
        let decoded = match runner_id {
            "local:exec" => RunnerConfig::Process(
                serde_json::from_value(value).map_err(|e| RunnerError::InvalidConfig(e.to_string()))?,
            ),
            "local:docker" => RunnerConfig::Container(
                serde_json::from_value(value).map_err(|e| RunnerError::InvalidConfig(e.to_string()))?,
            ),
            "cluster:k8s" => RunnerConfig::Cluster(
                serde_json::from_value(value).map_err(|e| RunnerError::InvalidConfig(e.to_string()))?,
            ),
            other => return Err(RunnerError::UnknownRunner(other.to_string())),
        };
        Ok(decoded)
    }
}

/// The interface every runner implements.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Canonical identifier, e.g. `local:docker`.
    fn id(&self) -> &'static str;

    /// Builders whose artifacts this runner can execute.
    fn compatible_builders(&self) -> &'static [&'static str];

    /// Enumerates environment preconditions, optionally fixing failures.
    async fn healthcheck(
        &self,
        fix: bool,
        ow: &OutputWriter,
    ) -> Result<HealthcheckReport, RunnerError>;

    /// Drives the full lifecycle of one run. Returns only once every
    /// instance reached a terminal state or the token fired.
    async fn run(
        &self,
        input: &RunInput,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<RunOutput, RunnerError>;

    /// Streams one compressed archive of the run's output tree into
    /// `out`.
    async fn collect_outputs(
        &self,
        input: &CollectionInput,
        out: mpsc::Sender<Bytes>,
        ow: &OutputWriter,
    ) -> Result<(), RunnerError>;

    /// Best-effort destruction of everything this runner manages.
    /// Runners without a teardown path report `Unsupported`.
    async fn terminate_all(&self, _ow: &OutputWriter) -> Result<(), RunnerError> {
        Err(RunnerError::Unsupported)
    }
}

/// Registry of available runners, keyed by id.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<&'static str, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.id(), runner);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Runner>, RunnerError> {
        self.runners
            .get(id)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownRunner(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.runners.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
