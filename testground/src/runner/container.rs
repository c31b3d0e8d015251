//! Container runner (`local:docker`).
//!
//! Stands up as many containers as the run indicates. Instances start on
//! the `testground-control` bridge so they can reach platform services;
//! a fresh per-run data bridge network carries peer-to-peer traffic, and
//! the per-host sidecar attaches instances to it and applies shaping.
//! Create and start happen in two phases with bounded concurrency to
//! avoid thrashing the daemon.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::docker::{
    ContainerApi, ContainerFilters, ContainerSpec, LogStream, NetworkSpec, Ulimit,
};
use crate::healthcheck::{self, HealthcheckReport, Helper};
use crate::outputs;
use crate::rpc::OutputWriter;
use crate::sync::SyncClient;

use super::params::RunParams;
use super::subnet::{control_gateway, control_subnet, DataSubnets};
use super::{CollectionInput, Runner, RunnerConfig, RunnerError, RunInput, RunOutput};

/// Name of the control network all plan and infra containers share.
pub const CONTROL_NETWORK: &str = "testground-control";

/// Name of the per-host sidecar container.
pub const SIDECAR_CONTAINER: &str = "testground-sidecar";

/// Bound on concurrent daemon calls during create/start/delete phases.
const DAEMON_CONCURRENCY: usize = 16;

/// Teardown budget per resource on cancellation.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the container runner. Booleans default to false so
/// the zero value is the default behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRunnerCfg {
    /// Retain plan containers after they exit.
    pub keep_containers: bool,
    /// Log level injected into plan containers.
    pub log_level: Option<String>,
    /// Create the containers without starting them.
    pub unstarted: bool,
    /// Skip tailing container output into the progress stream.
    pub background: bool,
    /// Ulimits applied to plan containers, `name=soft:hard` syntax.
    pub ulimits: Vec<String>,
}

impl Default for ContainerRunnerCfg {
    fn default() -> Self {
        Self {
            keep_containers: false,
            log_level: None,
            unstarted: false,
            background: false,
            ulimits: vec!["nofile=1048576:1048576".to_string()],
        }
    }
}

/// Runner scheduling instances as containers on a local daemon.
pub struct ContainerRunner {
    api: Arc<dyn ContainerApi>,
    outputs_dir: PathBuf,
    sync_endpoint: String,
    subnets: DataSubnets,
    /// Sidecar image used when the healthcheck has to start one.
    sidecar_image: String,
    lock: RwLock<()>,
}

impl ContainerRunner {
    pub fn new(
        api: Arc<dyn ContainerApi>,
        outputs_base: PathBuf,
        sync_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            api,
            outputs_dir: outputs_base.join("local_docker"),
            sync_endpoint: sync_endpoint.into(),
            subnets: DataSubnets::new(),
            sidecar_image: "testground/sidecar:edge".to_string(),
            lock: RwLock::new(()),
        }
    }

    fn plan_labels(input: &RunInput, group_id: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("testground.purpose".to_string(), "plan".to_string());
        labels.insert("testground.plan".to_string(), input.plan.clone());
        labels.insert("testground.testcase".to_string(), input.case.clone());
        labels.insert("testground.run_id".to_string(), input.run_id.clone());
        labels.insert("testground.group_id".to_string(), group_id.to_string());
        labels
    }

    async fn new_data_network(
        &self,
        input: &RunInput,
    ) -> Result<(String, String), RunnerError> {
        let (subnet, gateway) = self.subnets.next();
        let name = format!("tg-{}-{}-{}", sanitize(&input.plan), input.case, input.run_id);

        let mut labels = BTreeMap::new();
        labels.insert("testground.plan".to_string(), input.plan.clone());
        labels.insert("testground.testcase".to_string(), input.case.clone());
        labels.insert("testground.run_id".to_string(), input.run_id.clone());
        labels.insert("testground.name".to_string(), "default".to_string());

        let id = self
            .api
            .create_network(&NetworkSpec {
                name,
                labels,
                subnet: subnet.clone(),
                gateway,
                internal: true,
            })
            .await
            .map_err(|e| RunnerError::Backend(e.to_string()))?;
        Ok((id, subnet))
    }

    async fn delete_containers(&self, ids: &[String], ow: &OutputWriter) {
        let semaphore = Arc::new(Semaphore::new(DAEMON_CONCURRENCY));
        let mut deletions = Vec::new();
        for id in ids {
            let api = Arc::clone(&self.api);
            let semaphore = Arc::clone(&semaphore);
            let id = id.clone();
            let ow = ow.clone();
            deletions.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                ow.debug("deleting container", &[("id", &id)]);
                let delete = api.remove_container(&id, true);
                match tokio::time::timeout(TEARDOWN_TIMEOUT, delete).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        ow.warn("failed to delete container", &[("id", &id), ("err", &err.to_string())]);
                    }
                    Err(_) => {
                        ow.warn("container deletion timed out", &[("id", &id)]);
                    }
                }
            }));
        }
        for d in deletions {
            let _ = d.await;
        }
    }

    async fn teardown(
        &self,
        containers: &[String],
        network_id: &str,
        ow: &OutputWriter,
    ) {
        self.delete_containers(containers, ow).await;
        let remove = self.api.remove_network(network_id);
        match tokio::time::timeout(TEARDOWN_TIMEOUT, remove).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                ow.warn("failed to remove data network", &[("network", network_id), ("err", &err.to_string())]);
            }
            Err(_) => ow.warn("data network removal timed out", &[("network", network_id)]),
        }
    }
}

fn sanitize(plan: &str) -> String {
    plan.replace('/', "-")
}

#[async_trait]
impl Runner for ContainerRunner {
    fn id(&self) -> &'static str {
        "local:docker"
    }

    fn compatible_builders(&self) -> &'static [&'static str] {
        &["docker:generic"]
    }

    async fn healthcheck(
        &self,
        fix: bool,
        ow: &OutputWriter,
    ) -> Result<HealthcheckReport, RunnerError> {
        let _guard = self.lock.write().await;

        let mut helper = Helper::new();

        // outputs directory
        helper.enlist(
            "local-outputs-dir",
            healthcheck::dir_exists_check(self.outputs_dir.clone()),
            healthcheck::create_dir_fix(self.outputs_dir.clone()),
        );

        // control network
        {
            let api = Arc::clone(&self.api);
            let check_api = Arc::clone(&api);
            helper.enlist(
                "control-network",
                healthcheck::step(move || {
                    let api = Arc::clone(&check_api);
                    async move {
                        let nets = api
                            .list_networks(Some("testground.name=control"))
                            .await
                            .map_err(|e| e.to_string())?;
                        if nets.iter().any(|n| n.name == CONTROL_NETWORK) {
                            Ok("control network exists".to_string())
                        } else {
                            Err("control network missing".to_string())
                        }
                    }
                }),
                healthcheck::step(move || {
                    let api = Arc::clone(&api);
                    async move {
                        let mut labels = BTreeMap::new();
                        labels.insert("testground.name".to_string(), "control".to_string());
                        api.create_network(&NetworkSpec {
                            name: CONTROL_NETWORK.to_string(),
                            labels,
                            subnet: control_subnet().to_string(),
                            gateway: control_gateway().to_string(),
                            internal: false,
                        })
                        .await
                        .map_err(|e| e.to_string())?;
                        Ok("created control network".to_string())
                    }
                }),
            );
        }

        // coordination service reachability
        {
            let endpoint = self.sync_endpoint.clone();
            helper.enlist_unfixable(
                "sync-service",
                healthcheck::step(move || {
                    let endpoint = endpoint.clone();
                    async move {
                        let client = SyncClient::new(&endpoint).map_err(|e| e.to_string())?;
                        client
                            .healthz()
                            .await
                            .map_err(|e| format!("sync service unreachable: {}", e))?;
                        Ok(format!("sync service reachable at {}", endpoint))
                    }
                }),
            );
        }

        // sidecar container on the control network
        {
            let api = Arc::clone(&self.api);
            let check_api = Arc::clone(&api);
            let image = self.sidecar_image.clone();
            let sync_endpoint = self.sync_endpoint.clone();
            helper.enlist(
                "sidecar-container",
                healthcheck::step(move || {
                    let api = Arc::clone(&check_api);
                    async move {
                        let found = api
                            .list_containers(
                                &ContainerFilters::by_names([SIDECAR_CONTAINER]),
                                false,
                            )
                            .await
                            .map_err(|e| e.to_string())?;
                        if found.is_empty() {
                            Err("sidecar container not running".to_string())
                        } else {
                            Ok("sidecar container running".to_string())
                        }
                    }
                }),
                healthcheck::step(move || {
                    let api = Arc::clone(&api);
                    let image = image.clone();
                    let sync_endpoint = sync_endpoint.clone();
                    async move {
                        let spec = ContainerSpec {
                            name: SIDECAR_CONTAINER.to_string(),
                            image,
                            entrypoint: vec!["testground-daemon".to_string()],
                            cmd: vec![
                                "sidecar".to_string(),
                                "--runner".to_string(),
                                "docker".to_string(),
                            ],
                            env: vec![format!("SYNC_SERVICE_ENDPOINT={}", sync_endpoint)],
                            network_mode: Some(CONTROL_NETWORK.to_string()),
                            // Namespace entry needs both; pid host to
                            // resolve container namespaces.
                            cap_add: vec!["NET_ADMIN".to_string(), "SYS_ADMIN".to_string()],
                            pid_mode: Some("host".to_string()),
                            restart_policy: Some("unless-stopped".to_string()),
                            publish_all_ports: true,
                            ulimits: Ulimit::parse("nofile=1048576:1048576")
                                .into_iter()
                                .collect(),
                            ..Default::default()
                        };
                        let id = api
                            .create_container(&spec)
                            .await
                            .map_err(|e| e.to_string())?;
                        api.start_container(&id).await.map_err(|e| e.to_string())?;
                        Ok("started sidecar container".to_string())
                    }
                }),
            );
        }

        Ok(helper.run_checks(fix, ow).await)
    }

    async fn run(
        &self,
        input: &RunInput,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        // Many runs may proceed simultaneously, exclusive only of
        // state-altering healthchecks.
        let _guard = self.lock.read().await;

        let RunnerConfig::Container(cfg) = &input.config else {
            return Err(RunnerError::ConfigMismatch { runner: self.id() });
        };

        let log = ow.with(&[("runner", self.id()), ("run_id", &input.run_id)]);

        let (network_id, subnet) = self.new_data_network(input).await?;
        let ulimits: Vec<Ulimit> = cfg
            .ulimits
            .iter()
            .filter_map(|raw| {
                let parsed = Ulimit::parse(raw);
                if parsed.is_none() {
                    log.warn("invalid ulimit will be ignored", &[("ulimit", raw)]);
                }
                parsed
            })
            .collect();

        // Phase 1: create every container and attach it to the data
        // network.
        let mut containers: Vec<String> = Vec::new();
        let mut create_err: Option<RunnerError> = None;

        'create: for group in &input.groups {
            for i in 0..group.instances {
                let odir = self
                    .outputs_dir
                    .join(&input.plan)
                    .join(&input.run_id)
                    .join(&group.id)
                    .join(i.to_string());
                if let Err(err) = tokio::fs::create_dir_all(&odir).await {
                    create_err = Some(RunnerError::Io(err));
                    break 'create;
                }

                let params = RunParams {
                    plan: input.plan.clone(),
                    case: input.case.clone(),
                    run_id: input.run_id.clone(),
                    total_instances: input.total_instances,
                    group_id: group.id.clone(),
                    group_instance_count: group.instances,
                    params: group.parameters.clone(),
                    outputs_path: "/outputs".to_string(),
                    subnet: subnet.clone(),
                    sidecar: true,
                    start_time: Utc::now(),
                    sync_endpoint: self.sync_endpoint.clone(),
                };

                let mut env: Vec<String> = params
                    .to_env()
                    .into_iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                if let Some(level) = &cfg.log_level {
                    env.push(format!("LOG_LEVEL={}", level));
                }

                let name = format!(
                    "tg-{}-{}-{}-{}-{}",
                    sanitize(&input.plan),
                    input.case,
                    input.run_id,
                    group.id,
                    i
                );
                log.info("creating container", &[("name", &name)]);

                let spec = ContainerSpec {
                    name,
                    image: group.artifact.clone(),
                    env,
                    labels: Self::plan_labels(input, &group.id),
                    network_mode: Some(CONTROL_NETWORK.to_string()),
                    binds: vec![format!("{}:/outputs", odir.to_string_lossy())],
                    ulimits: ulimits.clone(),
                    publish_all_ports: true,
                    ..Default::default()
                };

                let id = match self.api.create_container(&spec).await {
                    Ok(id) => id,
                    Err(err) => {
                        create_err = Some(RunnerError::Backend(err.to_string()));
                        break 'create;
                    }
                };
                containers.push(id.clone());

                if let Err(err) = self.api.connect_network(&network_id, &id).await {
                    create_err = Some(RunnerError::Backend(err.to_string()));
                    break 'create;
                }
            }
        }

        if let Some(err) = create_err {
            log.error("aborting run during container creation", &[("err", &err.to_string())]);
            if !cfg.keep_containers {
                self.teardown(&containers, &network_id, &log).await;
            }
            return Err(err);
        }

        if cfg.unstarted {
            log.info("containers created unstarted as requested", &[("count", &containers.len().to_string())]);
            return Ok(RunOutput {
                run_id: input.run_id.clone(),
            });
        }

        // Phase 2: start with bounded concurrency.
        log.info("starting containers", &[("count", &containers.len().to_string())]);
        let semaphore = Arc::new(Semaphore::new(DAEMON_CONCURRENCY));
        let mut starts = Vec::new();
        for id in &containers {
            let api = Arc::clone(&self.api);
            let semaphore = Arc::clone(&semaphore);
            let id = id.clone();
            let token = token.clone();
            starts.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                if token.is_cancelled() {
                    return (id, Err("cancelled before start".to_string()));
                }
                let result = api.start_container(&id).await.map_err(|e| e.to_string());
                (id, result)
            }));
        }

        let mut started = Vec::new();
        let mut failed = 0usize;
        for start in starts {
            match start.await {
                Ok((id, Ok(()))) => started.push(id),
                Ok((id, Err(err))) => {
                    log.error("failed to start container", &[("id", &id), ("err", &err)]);
                    failed += 1;
                }
                Err(err) => {
                    log.error("start task panicked", &[("err", &err.to_string())]);
                    failed += 1;
                }
            }
        }

        // Tail logs into the progress stream unless running in the
        // background.
        let mut tails = Vec::new();
        if !cfg.background {
            for id in &started {
                match self.api.container_logs(id, true).await {
                    Ok(mut rx) => {
                        let log = log.clone();
                        let short = id.chars().take(12).collect::<String>();
                        tails.push(tokio::spawn(async move {
                            while let Some(line) = rx.recv().await {
                                let stream = match line.stream {
                                    LogStream::Stdout => "stdout",
                                    LogStream::Stderr => "stderr",
                                };
                                log.info(&line.line, &[("instance", &short), ("stream", stream)]);
                            }
                        }));
                    }
                    Err(err) => {
                        log.warn("failed to tail container logs", &[("id", id), ("err", &err.to_string())]);
                    }
                }
            }
        }

        // Wait for every started container to exit, or for cancellation.
        let mut waiters = Vec::new();
        for id in &started {
            let api = Arc::clone(&self.api);
            let id = id.clone();
            waiters.push(tokio::spawn(async move {
                api.wait_container(&id).await
            }));
        }

        let wait_all = async {
            let mut non_zero = 0usize;
            for waiter in waiters {
                match waiter.await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(code)) => {
                        log.warn("container exited non-zero", &[("code", &code.to_string())]);
                        non_zero += 1;
                    }
                    Ok(Err(err)) => {
                        log.error("container wait failed", &[("err", &err.to_string())]);
                        non_zero += 1;
                    }
                    Err(err) => {
                        log.error("wait task panicked", &[("err", &err.to_string())]);
                        non_zero += 1;
                    }
                }
            }
            non_zero
        };

        let outcome = tokio::select! {
            non_zero = wait_all => Ok(non_zero),
            _ = token.cancelled() => Err(RunnerError::Cancelled),
        };

        for tail in tails {
            tail.abort();
        }

        // Teardown: plan containers and the data network, unless asked to
        // keep them. On cancellation teardown always runs.
        match outcome {
            Ok(non_zero) => {
                if !cfg.keep_containers {
                    self.teardown(&containers, &network_id, &log).await;
                }
                let failed_total = failed + non_zero;
                if failed_total > 0 {
                    return Err(RunnerError::InstancesFailed {
                        failed: failed_total,
                        total: input.total_instances as usize,
                    });
                }
                Ok(RunOutput {
                    run_id: input.run_id.clone(),
                })
            }
            Err(err) => {
                log.warn("run cancelled; deleting containers and data network", &[]);
                self.teardown(&containers, &network_id, &log).await;
                Err(err)
            }
        }
    }

    async fn collect_outputs(
        &self,
        input: &CollectionInput,
        out: mpsc::Sender<Bytes>,
        ow: &OutputWriter,
    ) -> Result<(), RunnerError> {
        let _guard = self.lock.read().await;
        ow.info("collecting outputs", &[("run_id", &input.run_id)]);
        outputs::archive_run(&self.outputs_dir, &input.run_id, out).await?;
        Ok(())
    }

    /// Deletes every managed container: infra by name, plan containers by
    /// the `testground.purpose=plan` label. Networks and images stay.
    async fn terminate_all(&self, ow: &OutputWriter) -> Result<(), RunnerError> {
        ow.info("terminate local:docker requested", &[]);

        let infra = self
            .api
            .list_containers(
                &ContainerFilters::by_names([SIDECAR_CONTAINER]),
                true,
            )
            .await
            .map_err(|e| RunnerError::Backend(format!("failed to list infrastructure containers: {}", e)))?;
        let plans = self
            .api
            .list_containers(&ContainerFilters::by_label("testground.purpose=plan"), true)
            .await
            .map_err(|e| RunnerError::Backend(format!("failed to list test plan containers: {}", e)))?;

        let ids: Vec<String> = infra
            .into_iter()
            .chain(plans)
            .map(|c| c.id)
            .collect();
        self.delete_containers(&ids, ow).await;

        ow.info(
            "to delete networks and images, you may want to prune the daemon",
            &[],
        );
        Ok(())
    }
}
