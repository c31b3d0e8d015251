//! Sidecar: per-host data-plane manager for container-based runners.
//!
//! One sidecar runs on every host that executes plan instances. It
//! watches container lifecycle, discovers plan containers by label,
//! fixes up their routing (control-plane routes pinned to the control
//! link, default routes dropped from data links), reports network
//! readiness through the coordination service, and then applies every
//! [`NetworkConfig`] the test plan publishes on the instance's hostname
//! topic, acknowledging each one by signalling its `state` counter.

mod docker;
mod link;

pub use docker::{DockerReactor, SidecarMode};
pub use link::{CniInvoker, CommandRunner, HostCommandRunner, LinkInfo, NetnsExec};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::docker::{DockerError, HttpContainerApi};
use crate::rpc::OutputWriter;
use crate::runner::RunParams;
use crate::sync::{
    network_topic, NetworkConfig, SyncApi, SyncClient, SyncError, NETWORK_INITIALIZED_STATE,
    NETWORK_INIT_FAILED, NETWORK_INIT_SUCCESSFUL,
};

/// Errors surfaced by the sidecar.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("command failed: {0}")]
    Command(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("instance environment invalid: {0}")]
    Environment(String),

    #[error("unsupported network configuration: {0}")]
    Unsupported(String),
}

/// Applies network configuration changes to one instance's data plane.
#[async_trait]
pub trait InstanceNetwork: Send + Sync {
    async fn configure(&self, cfg: &NetworkConfig) -> Result<(), SidecarError>;
}

/// One managed plan instance.
pub struct Instance {
    pub container_id: String,
    pub hostname: String,
    pub params: RunParams,
    pub network: Arc<dyn InstanceNetwork>,
}

/// Drives the coordination workflow for one instance:
///
/// 1. signal entry to the network-initialized state
/// 2. wait for every instance's sidecar to do the same
/// 3. subscribe to the instance's hostname topic and apply each
///    [`NetworkConfig`], signalling its `state` counter afterwards
pub async fn supervise_instance(
    sync: Arc<dyn SyncApi>,
    instance: Instance,
    token: CancellationToken,
) -> Result<(), SidecarError> {
    let run_id = instance.params.run_id.clone();

    sync.signal_entry(&run_id, NETWORK_INITIALIZED_STATE).await?;
    info!(
        container = %instance.container_id,
        "waiting for all networks to be ready"
    );
    sync.barrier(
        &run_id,
        NETWORK_INITIALIZED_STATE,
        u64::from(instance.params.total_instances),
        &token,
    )
    .await?;
    info!(container = %instance.container_id, "all networks ready");

    let topic = network_topic(&instance.hostname);
    let mut changes = sync.subscribe(&run_id, &topic, &token).await?;

    while let Some(raw) = changes.recv().await {
        let cfg: NetworkConfig = match serde_json::from_value(raw) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(%err, "skipping undecodable network config");
                continue;
            }
        };

        info!(
            container = %instance.container_id,
            network = %cfg.network,
            "applying network change"
        );
        instance.network.configure(&cfg).await?;
        sync.signal_entry(&run_id, &cfg.state).await?;
    }

    Ok(())
}

/// Sidecar process configuration.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub mode: SidecarMode,
    pub docker_endpoint: String,
    pub sync_endpoint: String,
    /// Host path to CNI plugin binaries (cluster mode).
    pub cni_path: String,
}

/// Entrypoint for the `sidecar` subcommand. Watches containers until
/// the token fires.
pub async fn run_sidecar(
    config: SidecarConfig,
    ow: OutputWriter,
    token: CancellationToken,
) -> Result<(), SidecarError> {
    let api = Arc::new(HttpContainerApi::new(&config.docker_endpoint)?);
    let sync = Arc::new(SyncClient::new(&config.sync_endpoint)?);
    let commands = Arc::new(HostCommandRunner);

    let reactor = DockerReactor::new(
        config.mode,
        api,
        sync,
        commands,
        config.sync_endpoint.clone(),
        config.cni_path.clone(),
    );
    reactor.run(ow, token).await
}

// Re-exported for integration tests and the reactor.
pub(crate) fn log_network_ready(container: &str, ok: bool) {
    if ok {
        info!(container = %container, "{}", NETWORK_INIT_SUCCESSFUL);
    } else {
        warn!(container = %container, "{}", NETWORK_INIT_FAILED);
    }
}
