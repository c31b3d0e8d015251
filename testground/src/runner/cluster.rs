//! Cluster pod runner (`cluster:k8s`).
//!
//! Schedules instances as pods across the plan-labeled nodes of a
//! cluster. Admission is checked against allocatable CPU before any pod
//! is created; dispatch is throttled; a monitor classifies pod phases
//! every two seconds under a global watchdog. Network readiness is
//! detected through the coordination-service barrier the sidecars
//! signal, not by scraping logs; output collection happens through a
//! long-lived collector pod with the shared volume attached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::healthcheck::{self, HealthcheckReport, Helper};
use crate::k8s::{retry, ClientPool, ListParams, PodPhase, PodSpec};
use crate::rpc::OutputWriter;
use crate::sync::{SyncApi, SyncClient, NETWORK_INITIALIZED_STATE};

use super::params::RunParams;
use super::subnet::DataSubnets;
use super::{CollectionInput, Runner, RunnerConfig, RunnerError, RunInput, RunOutput};

/// Node label selecting plan workers.
const PLAN_NODE_SELECTOR: &str = "testground.nodetype=plan";

/// CPU reserved on every node for its sidecar, in millicores.
const SIDECAR_CPU_MILLIS: i64 = 200;

/// Share of remaining CPU the platform allows itself.
const UTILISATION: f64 = 0.85;

/// Bound on concurrent pod creations.
const DISPATCH_CONCURRENCY: usize = 30;

/// Pod phase poll interval.
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Global watchdog for one run.
const RUN_TIMEOUT: Duration = Duration::from_secs(100 * 60);

/// CNI annotation selecting the secondary data-plane network.
const DATA_PLANE_ANNOTATION: &str = "flannel";

/// Name of the long-lived output collector pod.
const COLLECT_OUTPUTS_POD: &str = "collect-outputs";

/// Shared volume claim holding run outputs.
const OUTPUTS_CLAIM: &str = "outputs-shared";

/// Configuration for the cluster runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterRunnerCfg {
    /// Log level injected into plan pods.
    pub log_level: Option<String>,
    /// Keep plan pods after the run.
    pub keep_service: bool,
    /// Default per-pod memory limit.
    pub pod_resource_memory: String,
    /// Default per-pod CPU limit.
    pub pod_resource_cpu: String,
}

impl Default for ClusterRunnerCfg {
    fn default() -> Self {
        Self {
            log_level: None,
            keep_service: false,
            pod_resource_memory: "100Mi".to_string(),
            pod_resource_cpu: "100m".to_string(),
        }
    }
}

/// Runner scheduling instances as cluster pods.
pub struct ClusterRunner {
    pool: ClientPool,
    sync: Arc<dyn SyncApi>,
    sync_endpoint: String,
    subnets: DataSubnets,
    lock: RwLock<()>,
}

impl ClusterRunner {
    pub fn new(
        pool: ClientPool,
        sync: Arc<dyn SyncApi>,
        sync_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            sync,
            sync_endpoint: sync_endpoint.into(),
            subnets: DataSubnets::new(),
            lock: RwLock::new(()),
        }
    }

    fn pod_name(input: &RunInput, group_id: &str, index: u32) -> String {
        format!(
            "tg-{}-{}-{}-{}",
            input.plan.replace('/', "-"),
            input.run_id,
            group_id,
            index
        )
    }

    /// Admission control: will the requested CPU fit on the plan nodes?
    async fn check_cluster_resources(
        &self,
        input: &RunInput,
        default_cpu: &str,
        ow: &OutputWriter,
    ) -> Result<bool, RunnerError> {
        let client = self.pool.acquire().await;
        let nodes = retry(5, Duration::from_secs(5), || {
            client.list_nodes(PLAN_NODE_SELECTOR)
        })
        .await
        .map_err(|e| RunnerError::Backend(e.to_string()))?;
        drop(client);

        if nodes.is_empty() {
            return Err(RunnerError::Precondition(
                "no plan nodes available in the cluster".to_string(),
            ));
        }

        let total_millis: i64 = nodes.iter().map(|n| n.allocatable_cpu_millis).sum();
        let available =
            (total_millis - nodes.len() as i64 * SIDECAR_CPU_MILLIS) as f64 * UTILISATION;

        let default_millis = crate::k8s::cpu_quantity_millis(default_cpu)
            .ok_or_else(|| RunnerError::InvalidConfig(format!("bad cpu quantity: {}", default_cpu)))?;

        let mut needed: f64 = 0.0;
        for group in &input.groups {
            let per_pod = group
                .resources
                .cpu
                .as_deref()
                .and_then(crate::k8s::cpu_quantity_millis)
                .unwrap_or(default_millis);
            needed += (per_pod * group.instances as i64) as f64;
        }

        if needed < available {
            return Ok(true);
        }
        ow.warn(
            "not enough resources on cluster",
            &[
                ("available_millis", &format!("{:.0}", available)),
                ("needed_millis", &format!("{:.0}", needed)),
                ("utilisation", &UTILISATION.to_string()),
            ],
        );
        Ok(false)
    }

    /// Polls pod phases until the run completes, reporting milestones.
    /// Returns `(succeeded, failed)` counts.
    async fn monitor_run(
        &self,
        input: &RunInput,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<(usize, usize), RunnerError> {
        let started = tokio::time::Instant::now();
        let list_params = ListParams::labels(format!("testground.run_id={}", input.run_id));
        let total = input.total_instances as usize;

        let mut all_running = false;
        let mut all_networks = false;

        // The sidecars signal the barrier once per instance; waiting on
        // it replaces log scraping for readiness detection.
        let barrier_done = Arc::new(tokio::sync::Notify::new());
        let mut barrier_started = false;

        loop {
            if token.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }
            if started.elapsed() > RUN_TIMEOUT {
                return Err(RunnerError::Timeout("global run timeout".to_string()));
            }
            tokio::time::sleep(MONITOR_INTERVAL).await;

            let client = self.pool.acquire().await;
            let pods = match retry(5, Duration::from_secs(5), || {
                client.list_pods(&list_params)
            })
            .await
            {
                Ok(pods) => pods,
                Err(err) => {
                    ow.warn("pod listing failed", &[("err", &err.to_string())]);
                    continue;
                }
            };
            drop(client);

            let mut counts: HashMap<PodPhase, usize> = HashMap::new();
            for pod in &pods {
                *counts.entry(pod.phase).or_default() += 1;
            }
            let succeeded = counts.get(&PodPhase::Succeeded).copied().unwrap_or(0);
            let failed = counts.get(&PodPhase::Failed).copied().unwrap_or(0);
            let running = counts.get(&PodPhase::Running).copied().unwrap_or(0);
            let pending = counts.get(&PodPhase::Pending).copied().unwrap_or(0);

            ow.debug(
                "testplan pods state",
                &[
                    ("running_for", &format!("{:?}", started.elapsed())),
                    ("succeeded", &succeeded.to_string()),
                    ("running", &running.to_string()),
                    ("pending", &pending.to_string()),
                    ("failed", &failed.to_string()),
                ],
            );

            if running == total && !all_running {
                all_running = true;
                ow.info(
                    "all testplan instances running",
                    &[("took", &format!("{:?}", started.elapsed()))],
                );
            }

            if all_running && !barrier_started {
                barrier_started = true;
                let sync = Arc::clone(&self.sync);
                let run_id = input.run_id.clone();
                let done = Arc::clone(&barrier_done);
                let barrier_token = token.clone();
                let total = input.total_instances as u64;
                tokio::spawn(async move {
                    if sync
                        .barrier(&run_id, NETWORK_INITIALIZED_STATE, total, &barrier_token)
                        .await
                        .is_ok()
                    {
                        done.notify_waiters();
                        done.notify_one();
                    }
                });
            }

            if barrier_started && !all_networks {
                // Non-blocking peek at the barrier outcome.
                let notified = barrier_done.notified();
                tokio::pin!(notified);
                if futures::poll!(&mut notified).is_ready() {
                    all_networks = true;
                    ow.info(
                        "all testplan instance networks initialised",
                        &[("took", &format!("{:?}", started.elapsed()))],
                    );
                }
            }

            if succeeded == total {
                ow.info(
                    "all testplan instances succeeded",
                    &[("took", &format!("{:?}", started.elapsed()))],
                );
                return Ok((succeeded, failed));
            }
            if succeeded + failed == total {
                ow.warn(
                    "testplan instances finished with failures",
                    &[("succeeded", &succeeded.to_string()), ("failed", &failed.to_string())],
                );
                return Ok((succeeded, failed));
            }
        }
    }

    async fn teardown(&self, ow: &OutputWriter) {
        let client = self.pool.acquire().await;
        if let Err(err) = client.delete_pods_by_label("testground.purpose=plan").await {
            ow.warn("failed to delete plan pods", &[("err", &err.to_string())]);
        }
    }

    /// Makes sure the collector pod with the shared volume is running.
    async fn ensure_collector_pod(&self) -> Result<(), RunnerError> {
        let client = self.pool.acquire().await;
        let existing = client
            .list_pods(&ListParams {
                label_selector: None,
                field_selector: Some(format!("metadata.name={}", COLLECT_OUTPUTS_POD)),
            })
            .await
            .map_err(|e| RunnerError::Backend(e.to_string()))?;

        if existing.is_empty() {
            let mut labels = std::collections::BTreeMap::new();
            labels.insert("testground.purpose".to_string(), "outputs".to_string());
            client
                .create_pod(&PodSpec {
                    name: COLLECT_OUTPUTS_POD.to_string(),
                    image: "busybox".to_string(),
                    labels,
                    command: vec!["sh".to_string()],
                    args: vec!["-c".to_string(), "sleep 999999999".to_string()],
                    volume_claim: Some(OUTPUTS_CLAIM.to_string()),
                    mount_path: "/outputs".to_string(),
                    cpu_limit: Some("2000m".to_string()),
                    memory_limit: Some("1024Mi".to_string()),
                    ..Default::default()
                })
                .await
                .map_err(|e| RunnerError::Backend(e.to_string()))?;
        }
        drop(client);

        // Wait until it reports Running.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            let client = self.pool.acquire().await;
            let pods = client
                .list_pods(&ListParams {
                    label_selector: None,
                    field_selector: Some(format!("metadata.name={}", COLLECT_OUTPUTS_POD)),
                })
                .await
                .map_err(|e| RunnerError::Backend(e.to_string()))?;
            drop(client);

            if pods.iter().any(|p| p.phase == PodPhase::Running) {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                return Err(RunnerError::Timeout(
                    "collector pod did not reach Running".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[async_trait]
impl Runner for ClusterRunner {
    fn id(&self) -> &'static str {
        "cluster:k8s"
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

        {
            let pool = self.pool.clone();
            helper.enlist(
                "plan-nodes",
                healthcheck::step(move || {
                    let pool = pool.clone();
                    async move {
                        let client = pool.acquire().await;
                        let nodes = client
                            .list_nodes(PLAN_NODE_SELECTOR)
                            .await
                            .map_err(|e| e.to_string())?;
                        if nodes.is_empty() {
                            Err("no plan-labeled worker nodes".to_string())
                        } else {
                            Ok(format!("{} plan nodes available", nodes.len()))
                        }
                    }
                }),
                healthcheck::not_implemented(),
            );
        }

        {
            let pool = self.pool.clone();
            helper.enlist(
                "sidecar-pods",
                healthcheck::step(move || {
                    let pool = pool.clone();
                    async move {
                        let client = pool.acquire().await;
                        let nodes = client
                            .list_nodes(PLAN_NODE_SELECTOR)
                            .await
                            .map_err(|e| e.to_string())?;
                        let sidecars = client
                            .list_pods(&ListParams::labels("name=testground-sidecar"))
                            .await
                            .map_err(|e| e.to_string())?;
                        if sidecars.len() >= nodes.len() && !nodes.is_empty() {
                            Ok(format!("{} sidecar pods running", sidecars.len()))
                        } else {
                            Err(format!(
                                "expected {} sidecar pods, found {}",
                                nodes.len(),
                                sidecars.len()
                            ))
                        }
                    }
                }),
                healthcheck::not_implemented(),
            );
        }

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

        Ok(helper.run_checks(fix, ow).await)
    }

    async fn run(
        &self,
        input: &RunInput,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        let _guard = self.lock.read().await;

        let RunnerConfig::Cluster(cfg) = &input.config else {
            return Err(RunnerError::ConfigMismatch { runner: self.id() });
        };

        let log = ow.with(&[("runner", self.id()), ("run_id", &input.run_id)]);

        if !self
            .check_cluster_resources(input, &cfg.pod_resource_cpu, &log)
            .await?
        {
            return Err(RunnerError::Precondition(
                "too many test instances requested, resize cluster if you need more capacity"
                    .to_string(),
            ));
        }

        let (subnet, _) = self.subnets.next();
        log.info(
            "deploying testplan run on the cluster",
            &[("plan", &input.plan), ("subnet", &subnet)],
        );

        // Dispatch: one pod per instance, throttled.
        let semaphore = Arc::new(Semaphore::new(DISPATCH_CONCURRENCY));
        let mut dispatches = Vec::new();

        for group in &input.groups {
            for i in 0..group.instances {
                let params = RunParams {
                    plan: input.plan.clone(),
                    case: input.case.clone(),
                    run_id: input.run_id.clone(),
                    total_instances: input.total_instances,
                    group_id: group.id.clone(),
                    group_instance_count: group.instances,
                    params: group.parameters.clone(),
                    outputs_path: format!("/outputs/{}/{}/{}", input.run_id, group.id, i),
                    subnet: subnet.clone(),
                    sidecar: true,
                    start_time: Utc::now(),
                    sync_endpoint: self.sync_endpoint.clone(),
                };

                let mut env: Vec<(String, String)> = params.to_env();
                if let Some(level) = &cfg.log_level {
                    env.push(("LOG_LEVEL".to_string(), level.clone()));
                }

                let mut labels = std::collections::BTreeMap::new();
                labels.insert("testground.purpose".to_string(), "plan".to_string());
                labels.insert("testground.plan".to_string(), input.plan.replace('/', "-"));
                labels.insert("testground.testcase".to_string(), input.case.clone());
                labels.insert("testground.run_id".to_string(), input.run_id.clone());
                labels.insert("testground.group_id".to_string(), group.id.clone());

                let mut annotations = std::collections::BTreeMap::new();
                annotations.insert("cni".to_string(), DATA_PLANE_ANNOTATION.to_string());

                let mut sysctls = std::collections::BTreeMap::new();
                sysctls.insert("net.core.somaxconn".to_string(), "10000".to_string());

                let mut node_selector = std::collections::BTreeMap::new();
                node_selector.insert("testground.nodetype".to_string(), "plan".to_string());

                let spec = PodSpec {
                    name: Self::pod_name(input, &group.id, i),
                    image: group.artifact.clone(),
                    labels,
                    annotations,
                    env,
                    volume_claim: Some(OUTPUTS_CLAIM.to_string()),
                    mount_path: "/outputs".to_string(),
                    init_mkdir_path: Some(params.outputs_path.clone()),
                    cpu_limit: Some(
                        group
                            .resources
                            .cpu
                            .clone()
                            .unwrap_or_else(|| cfg.pod_resource_cpu.clone()),
                    ),
                    memory_limit: Some(
                        group
                            .resources
                            .memory
                            .clone()
                            .unwrap_or_else(|| cfg.pod_resource_memory.clone()),
                    ),
                    node_selector,
                    sysctls,
                    ..Default::default()
                };

                let pool = self.pool.clone();
                let semaphore = Arc::clone(&semaphore);
                let token = token.clone();
                dispatches.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    if token.is_cancelled() {
                        return Err(RunnerError::Cancelled);
                    }
                    let client = pool.acquire().await;
                    client
                        .create_pod(&spec)
                        .await
                        .map_err(|e| RunnerError::Backend(e.to_string()))
                }));
            }
        }

        let mut dispatch_err = None;
        for dispatch in dispatches {
            match dispatch.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => dispatch_err = Some(err),
                Err(err) => dispatch_err = Some(RunnerError::Backend(err.to_string())),
            }
        }
        if let Some(err) = dispatch_err {
            log.error("pod dispatch failed", &[("err", &err.to_string())]);
            if !cfg.keep_service {
                self.teardown(&log).await;
            }
            return Err(err);
        }

        // Monitor until terminal, cancelled or timed out.
        let outcome = self.monitor_run(input, &log, token).await;

        if !cfg.keep_service {
            self.teardown(&log).await;
        }

        let (succeeded, failed) = outcome?;
        if failed > 0 {
            return Err(RunnerError::InstancesFailed {
                failed,
                total: succeeded + failed,
            });
        }
        Ok(RunOutput {
            run_id: input.run_id.clone(),
        })
    }

    async fn collect_outputs(
        &self,
        input: &CollectionInput,
        out: mpsc::Sender<Bytes>,
        ow: &OutputWriter,
    ) -> Result<(), RunnerError> {
        let _guard = self.lock.read().await;

        ow.info("collecting outputs", &[("run_id", &input.run_id)]);
        self.ensure_collector_pod().await?;

        let client = self.pool.acquire().await;
        let command = vec![
            "tar".to_string(),
            "-C".to_string(),
            "/outputs".to_string(),
            "-czf".to_string(),
            "-".to_string(),
            input.run_id.clone(),
        ];
        let mut rx = client
            .exec_pod(COLLECT_OUTPUTS_POD, COLLECT_OUTPUTS_POD, &command)
            .await
            .map_err(|e| RunnerError::Backend(e.to_string()))?;
        drop(client);

        while let Some(chunk) = rx.recv().await {
            if out.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Deletes every plan pod in the cluster.
    async fn terminate_all(&self, ow: &OutputWriter) -> Result<(), RunnerError> {
        ow.info("terminate cluster:k8s requested", &[]);
        let client = self.pool.acquire().await;
        client
            .delete_pods_by_label("testground.purpose=plan")
            .await
            .map_err(|e| RunnerError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::Resources;
    use crate::k8s::{ClusterApi, MockClusterApi, NodeInfo};
    use crate::runner::RunGroup;
    use crate::sync::SyncStore;

    fn nodes(count: usize, cpu_millis: i64) -> Vec<NodeInfo> {
        (0..count)
            .map(|i| NodeInfo {
                name: format!("node-{}", i),
                allocatable_cpu_millis: cpu_millis,
            })
            .collect()
    }

    fn runner(api: Arc<MockClusterApi>) -> (ClusterRunner, Arc<SyncStore>) {
        let sync = Arc::new(SyncStore::new());
        let runner = ClusterRunner::new(
            ClientPool::new(api, 20),
            Arc::clone(&sync) as Arc<dyn SyncApi>,
            "http://127.0.0.1:1",
        );
        (runner, sync)
    }

    fn input(instances: u32, cpu: Option<&str>) -> RunInput {
        RunInput {
            run_id: "r-k8s".to_string(),
            plan: "network/ping-pong".to_string(),
            case: "ping-pong".to_string(),
            total_instances: instances,
            groups: vec![RunGroup {
                id: "all".to_string(),
                instances,
                artifact: "image:abc".to_string(),
                parameters: Default::default(),
                resources: Resources {
                    cpu: cpu.map(|c| c.to_string()),
                    memory: None,
                },
            }],
            config: RunnerConfig::Cluster(ClusterRunnerCfg::default()),
        }
    }

    #[tokio::test]
    async fn test_admission_rejects_oversized_runs() {
        // 1 node x 1000m; minus sidecar 200m, times 0.85 = 680m
        // available. 10 instances x 100m = 1000m needed.
        let api = Arc::new(MockClusterApi::with_nodes(nodes(1, 1000)));
        let (runner, _sync) = runner(Arc::clone(&api));
        let token = CancellationToken::new();

        let err = runner
            .run(&input(10, None), &OutputWriter::discard(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Precondition(_)));
        assert_eq!(api.pod_count(), 0);
    }

    #[tokio::test]
    async fn test_run_dispatches_pods_and_completes_on_success() {
        let api = Arc::new(MockClusterApi::with_nodes(nodes(4, 8000)));
        let (runner, _sync) = runner(Arc::clone(&api));
        let token = CancellationToken::new();

        let driver = {
            let api = Arc::clone(&api);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if api.pod_count() == 3 {
                        api.set_all_phases(PodPhase::Succeeded);
                        return;
                    }
                }
            })
        };

        let mut run_input = input(3, Some("500m"));
        run_input.config = RunnerConfig::Cluster(ClusterRunnerCfg {
            keep_service: true,
            ..Default::default()
        });
        let out = tokio::time::timeout(
            Duration::from_secs(30),
            runner.run(&run_input, &OutputWriter::discard(), &token),
        )
        .await
        .unwrap()
        .unwrap();
        driver.await.unwrap();
        assert_eq!(out.run_id, "r-k8s");

        let pods = api.pods.lock();
        assert_eq!(pods.len(), 3);
        let pod = pods.values().next().unwrap();
        assert_eq!(pod.spec.labels.get("testground.purpose").unwrap(), "plan");
        assert_eq!(pod.spec.annotations.get("cni").unwrap(), "flannel");
        assert_eq!(pod.spec.cpu_limit.as_deref(), Some("500m"));
        assert!(pod.spec.init_mkdir_path.as_deref().unwrap().starts_with("/outputs/r-k8s/all/"));
        assert_eq!(
            pod.spec.sysctls.get("net.core.somaxconn").unwrap(),
            "10000"
        );
    }

    #[tokio::test]
    async fn test_failed_pods_fail_the_run_and_teardown_happens() {
        let api = Arc::new(MockClusterApi::with_nodes(nodes(4, 8000)));
        let (runner, _sync) = runner(Arc::clone(&api));
        let token = CancellationToken::new();

        let driver = {
            let api = Arc::clone(&api);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if api.pod_count() == 2 {
                        let names: Vec<String> = api.pods.lock().keys().cloned().collect();
                        {
                            let mut pods = api.pods.lock();
                            pods.get_mut(&names[0]).unwrap().phase = PodPhase::Succeeded;
                            pods.get_mut(&names[1]).unwrap().phase = PodPhase::Failed;
                        }
                        return;
                    }
                }
            })
        };

        let err = tokio::time::timeout(
            Duration::from_secs(30),
            runner.run(&input(2, Some("100m")), &OutputWriter::discard(), &token),
        )
        .await
        .unwrap()
        .unwrap_err();
        driver.await.unwrap();

        assert!(matches!(
            err,
            RunnerError::InstancesFailed { failed: 1, total: 2 }
        ));
        // Default config deletes plan pods.
        assert_eq!(api.pod_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_monitor_and_deletes_pods() {
        let api = Arc::new(MockClusterApi::with_nodes(nodes(4, 8000)));
        let (runner, _sync) = runner(Arc::clone(&api));
        let token = CancellationToken::new();

        let cancel = token.clone();
        let api_watch = Arc::clone(&api);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if api_watch.pod_count() == 2 {
                    cancel.cancel();
                    return;
                }
            }
        });

        let err = tokio::time::timeout(
            Duration::from_secs(30),
            runner.run(&input(2, Some("100m")), &OutputWriter::discard(), &token),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
        assert_eq!(api.pod_count(), 0);
    }

    #[tokio::test]
    async fn test_collect_outputs_streams_exec_bytes() {
        let api = Arc::new(MockClusterApi::with_nodes(nodes(1, 8000)));
        *api.exec_output.lock() = b"tarball-bytes".to_vec();

        // A running collector pod already exists.
        api.create_pod(&PodSpec {
            name: COLLECT_OUTPUTS_POD.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        api.set_all_phases(PodPhase::Running);

        let (runner, _sync) = runner(Arc::clone(&api));
        let (tx, mut rx) = mpsc::channel(16);
        runner
            .collect_outputs(
                &CollectionInput {
                    run_id: "r-k8s".to_string(),
                    runner: "cluster:k8s".to_string(),
                },
                tx,
                &OutputWriter::discard(),
            )
            .await
            .unwrap();

        let chunk = rx.recv().await.unwrap();
        assert_eq!(&chunk[..], b"tarball-bytes");
    }

    #[tokio::test]
    async fn test_terminate_all_deletes_by_label() {
        let api = Arc::new(MockClusterApi::with_nodes(nodes(1, 8000)));
        let (runner, _sync) = runner(Arc::clone(&api));

        let mut labels = std::collections::BTreeMap::new();
        labels.insert("testground.purpose".to_string(), "plan".to_string());
        api.create_pod(&PodSpec {
            name: "tg-x".to_string(),
            labels,
            ..Default::default()
        })
        .await
        .unwrap();
        api.create_pod(&PodSpec {
            name: COLLECT_OUTPUTS_POD.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        runner.terminate_all(&OutputWriter::discard()).await.unwrap();

        // Plan pod gone, collector preserved.
        let pods = api.pods.lock();
        assert_eq!(pods.len(), 1);
        assert!(pods.contains_key(COLLECT_OUTPUTS_POD));
    }
}
