//! Container reactor.
//!
//! Discovers plan containers on the local daemon by label, prepares
//! their namespaces, and hands each one to the instance supervisor. The
//! per-container state lives in a single mutex-guarded map whose lock is
//! never held across a blocking call; a host-wide RwLock keeps run
//! operations (shared) exclusive of state-altering healthcheck fixes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::docker::{ContainerApi, ContainerFilters, ContainerInfo};
use crate::rpc::OutputWriter;
use crate::runner::params::ENV_SIDECAR;
use crate::runner::{ip_in_data_subnet, RunParams};
use crate::sync::{NetworkConfig, SyncApi};

use super::link::{CniInvoker, CommandRunner, NetnsExec};
use super::{log_network_ready, supervise_instance, Instance, InstanceNetwork, SidecarError};

/// How often the reactor polls the daemon for new plan containers.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// How often the sidecar opportunistically sweeps expired coordination
/// state.
const GC_INTERVAL: Duration = Duration::from_secs(600);

/// Which backend the sidecar serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarMode {
    /// Local container daemon; data networks are daemon bridge networks.
    Docker,
    /// Cluster pods; the data plane is attached through CNI.
    Cluster,
}

impl std::str::FromStr for SidecarMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(SidecarMode::Docker),
            "k8s" | "cluster" => Ok(SidecarMode::Cluster),
            other => Err(format!("unknown sidecar mode: {}", other)),
        }
    }
}

struct ActiveInstance {
    token: CancellationToken,
}

/// Watches the container daemon and supervises every plan instance on
/// this host.
pub struct DockerReactor {
    mode: SidecarMode,
    api: Arc<dyn ContainerApi>,
    sync: Arc<dyn SyncApi>,
    commands: Arc<dyn CommandRunner>,
    sync_endpoint: String,
    cni_path: String,
    active: Arc<Mutex<HashMap<String, ActiveInstance>>>,
    /// Shared for runs, exclusive for fixes.
    state_lock: Arc<tokio::sync::RwLock<()>>,
}

impl DockerReactor {
    pub fn new(
        mode: SidecarMode,
        api: Arc<dyn ContainerApi>,
        sync: Arc<dyn SyncApi>,
        commands: Arc<dyn CommandRunner>,
        sync_endpoint: String,
        cni_path: String,
    ) -> Self {
        Self {
            mode,
            api,
            sync,
            commands,
            sync_endpoint,
            cni_path,
            active: Arc::new(Mutex::new(HashMap::new())),
            state_lock: Arc::new(tokio::sync::RwLock::new(())),
        }
    }

    /// Main loop: discover new plan containers, reap gone ones, sweep
    /// coordination garbage.
    pub async fn run(
        self,
        ow: OutputWriter,
        token: CancellationToken,
    ) -> Result<(), SidecarError> {
        let reactor = Arc::new(self);
        ow.info("sidecar watching for plan containers", &[]);

        let mut last_gc = tokio::time::Instant::now();
        loop {
            if token.is_cancelled() {
                let active = reactor.active.lock();
                for instance in active.values() {
                    instance.token.cancel();
                }
                return Ok(());
            }

            match reactor
                .api
                .list_containers(&ContainerFilters::by_label("testground.purpose=plan"), false)
                .await
            {
                Ok(containers) => {
                    let seen: Vec<String> = containers.iter().map(|c| c.id.clone()).collect();

                    // Reap workers whose containers disappeared.
                    {
                        let mut active = reactor.active.lock();
                        active.retain(|id, instance| {
                            let alive = seen.contains(id);
                            if !alive {
                                debug!(container = %id, "container gone; cancelling worker");
                                instance.token.cancel();
                            }
                            alive
                        });
                    }

                    for summary in containers {
                        let is_new = !reactor.active.lock().contains_key(&summary.id);
                        if !is_new {
                            continue;
                        }
                        let child = token.child_token();
                        reactor.active.lock().insert(
                            summary.id.clone(),
                            ActiveInstance {
                                token: child.clone(),
                            },
                        );

                        let reactor = Arc::clone(&reactor);
                        let ow = ow.clone();
                        tokio::spawn(async move {
                            let id = summary.id.clone();
                            if let Err(err) = reactor.handle_container(&id, &ow, child).await {
                                warn!(container = %id, %err, "container worker failed");
                            }
                            reactor.active.lock().remove(&id);
                        });
                    }
                }
                Err(err) => {
                    warn!(%err, "container listing failed");
                }
            }

            if last_gc.elapsed() > GC_INTERVAL {
                last_gc = tokio::time::Instant::now();
                if let Err(err) = reactor.sync.gc_expired().await {
                    debug!(%err, "coordination GC sweep failed");
                }
            }

            tokio::select! {
                _ = token.cancelled() => continue,
                _ = tokio::time::sleep(DISCOVERY_INTERVAL) => {}
            }
        }
    }

    /// Prepares one container's namespace and supervises it.
    async fn handle_container(
        &self,
        id: &str,
        ow: &OutputWriter,
        token: CancellationToken,
    ) -> Result<(), SidecarError> {
        // Runs hold the lock shared; healthcheck fixes exclude them.
        let _guard = self.state_lock.read().await;

        debug!(container = %id, "got container");
        let info = self.api.inspect_container(id).await?;
        if !info.running {
            return Ok(());
        }

        // Only containers that opted into the sidecar.
        let wants_sidecar = info
            .env
            .iter()
            .any(|e| e == &format!("{}=true", ENV_SIDECAR));
        if !wants_sidecar {
            debug!(container = %id, "ignoring container without sidecar flag");
            return Ok(());
        }

        let params = RunParams::from_env(info.env.iter().map(|s| s.as_str()))
            .map_err(|e| SidecarError::Environment(e.to_string()))?;

        let netns = Arc::new(NetnsExec::new(Arc::clone(&self.commands), info.pid));
        match self.init_network(&info, &params, &netns).await {
            Ok(()) => {
                log_network_ready(id, true);
                ow.info("network initialisation successful", &[("container", id)]);
            }
            Err(err) => {
                log_network_ready(id, false);
                ow.error(
                    "network initialisation failed",
                    &[("container", id), ("err", &err.to_string())],
                );
                return Err(err);
            }
        }

        let network: Arc<dyn InstanceNetwork> = match self.mode {
            SidecarMode::Docker => Arc::new(DockerInstanceNetwork {
                api: Arc::clone(&self.api),
                netns: Arc::clone(&netns),
                container_id: id.to_string(),
                run_id: params.run_id.clone(),
                subnet: params.subnet.clone(),
                active_links: Mutex::new(HashMap::new()),
            }),
            SidecarMode::Cluster => Arc::new(CniInstanceNetwork {
                cni: CniInvoker::new(Arc::clone(&self.commands), self.cni_path.clone()),
                netns: Arc::clone(&netns),
                container_id: id.to_string(),
                pid: info.pid,
                subnet: params.subnet.clone(),
                attached: Mutex::new(HashMap::new()),
            }),
        };

        let instance = Instance {
            container_id: id.to_string(),
            hostname: info.hostname.clone(),
            params,
            network,
        };

        supervise_instance(Arc::clone(&self.sync), instance, token).await
    }

    /// Separates control from data links, pins control-plane routes and
    /// strips default routes off the data links.
    async fn init_network(
        &self,
        info: &ContainerInfo,
        params: &RunParams,
        netns: &NetnsExec,
    ) -> Result<(), SidecarError> {
        let links = netns.list_links().await?;

        let mut control_link: Option<String> = None;
        let mut data_links: Vec<String> = Vec::new();
        for link in &links {
            let is_data = link
                .addrs
                .iter()
                .any(|addr| ip_in_data_subnet(addr, &params.subnet));
            if is_data {
                data_links.push(link.name.clone());
            } else if control_link.is_none() {
                control_link = Some(link.name.clone());
            }
        }

        let control = control_link
            .ok_or_else(|| SidecarError::Environment("no control link found".to_string()))?;

        // Pin routes to every control-plane service onto the control
        // link.
        for addr in control_service_addrs(&self.sync_endpoint) {
            let (dev, gateway) = netns.route_get(&addr).await?;
            if dev != control {
                netns
                    .route_add(&format!("{}/32", addr), &control, gateway.as_deref())
                    .await?;
            }
        }

        // Data links must not carry a default route.
        for dev in &data_links {
            netns.route_del_default(dev).await?;
        }

        info!(
            container = %info.id,
            control = %control,
            data = ?data_links,
            "network links classified"
        );
        Ok(())
    }

    /// Takes the exclusive side of the run/fix lock; exposed so a
    /// host-level healthcheck fix can drain in-flight runs first.
    pub async fn exclusive_fix_guard(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.state_lock.write().await
    }
}

/// Resolves the control-plane service hosts the instances must keep
/// reachable. Today that is the coordination service.
fn control_service_addrs(sync_endpoint: &str) -> Vec<String> {
    let host = sync_endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split([':', '/'])
        .next()
        .unwrap_or_default();
    if host.is_empty() {
        Vec::new()
    } else {
        vec![host.to_string()]
    }
}

struct ActiveLink {
    device: String,
}

/// Data-plane control under the local daemon: attachment is a network
/// connect/disconnect, shaping is tc in the namespace.
struct DockerInstanceNetwork {
    api: Arc<dyn ContainerApi>,
    netns: Arc<NetnsExec>,
    container_id: String,
    run_id: String,
    subnet: String,
    active_links: Mutex<HashMap<String, ActiveLink>>,
}

impl DockerInstanceNetwork {
    async fn network_id(&self, name: &str) -> Result<String, SidecarError> {
        let label = format!("testground.run_id={}", self.run_id);
        let networks = self.api.list_networks(Some(&label)).await?;
        networks
            .iter()
            .find(|n| n.labels.get("testground.name").map(String::as_str) == Some(name))
            .map(|n| n.id.clone())
            .ok_or_else(|| {
                SidecarError::Unsupported(format!("no data network named {} for this run", name))
            })
    }

    async fn data_device(&self) -> Result<String, SidecarError> {
        let links = self.netns.list_links().await?;
        links
            .iter()
            .find(|l| l.addrs.iter().any(|a| ip_in_data_subnet(a, &self.subnet)))
            .map(|l| l.name.clone())
            .ok_or_else(|| SidecarError::Unsupported("no data link attached".to_string()))
    }
}

#[async_trait]
impl InstanceNetwork for DockerInstanceNetwork {
    async fn configure(&self, cfg: &NetworkConfig) -> Result<(), SidecarError> {
        if !cfg.rules.is_empty() {
            return Err(SidecarError::Unsupported(
                "per-subnet bandwidth rules not supported".to_string(),
            ));
        }

        let network_id = self.network_id(&cfg.network).await?;
        let attached = self.active_links.lock().contains_key(&cfg.network);

        if !cfg.enable {
            if attached {
                let device = self
                    .active_links
                    .lock()
                    .get(&cfg.network)
                    .map(|l| l.device.clone());
                if let Some(device) = device {
                    self.netns.clear_shape(&device).await?;
                }
                self.api
                    .disconnect_network(&network_id, &self.container_id, true)
                    .await?;
                self.active_links.lock().remove(&cfg.network);
            }
            return Ok(());
        }

        if cfg.ipv6.is_some() {
            return Err(SidecarError::Unsupported("ipv6 not supported".to_string()));
        }

        if !attached {
            self.api
                .connect_network(&network_id, &self.container_id)
                .await?;
        } else if cfg.ipv4.is_some() {
            // Address changes require a detach/reattach cycle.
            self.api
                .disconnect_network(&network_id, &self.container_id, true)
                .await?;
            self.api
                .connect_network(&network_id, &self.container_id)
                .await?;
        }

        let device = self.data_device().await?;
        self.active_links.lock().insert(
            cfg.network.clone(),
            ActiveLink {
                device: device.clone(),
            },
        );

        self.netns.shape(&device, &cfg.default).await
    }
}

/// Data-plane control under cluster mode: attachment goes through the
/// CNI plugin, shaping is tc on the attached interface.
struct CniInstanceNetwork {
    cni: CniInvoker,
    netns: Arc<NetnsExec>,
    container_id: String,
    pid: i64,
    subnet: String,
    attached: Mutex<HashMap<String, String>>,
}

const CNI_IFNAME: &str = "eth1";

#[async_trait]
impl InstanceNetwork for CniInstanceNetwork {
    async fn configure(&self, cfg: &NetworkConfig) -> Result<(), SidecarError> {
        if cfg.network != "default" {
            return Err(SidecarError::Unsupported(
                "configured network is not default".to_string(),
            ));
        }
        if !cfg.rules.is_empty() {
            return Err(SidecarError::Unsupported(
                "per-subnet bandwidth rules not supported".to_string(),
            ));
        }
        if cfg.ipv6.is_some() {
            return Err(SidecarError::Unsupported("ipv6 not supported".to_string()));
        }

        let attached_ip = self.attached.lock().get(&cfg.network).cloned();

        if !cfg.enable {
            if attached_ip.is_some() {
                self.cni
                    .detach(&self.container_id, self.pid, CNI_IFNAME, &self.subnet)
                    .await?;
                self.attached.lock().remove(&cfg.network);
            }
            return Ok(());
        }

        let wanted = cfg.ipv4.clone().unwrap_or_default();
        let needs_reattach = match &attached_ip {
            Some(current) => !wanted.is_empty() && current != &wanted,
            None => false,
        };

        if needs_reattach {
            self.cni
                .detach(&self.container_id, self.pid, CNI_IFNAME, &self.subnet)
                .await?;
            self.attached.lock().remove(&cfg.network);
        }

        if self.attached.lock().get(&cfg.network).is_none() {
            self.cni
                .attach(
                    &self.container_id,
                    self.pid,
                    CNI_IFNAME,
                    &self.subnet,
                    cfg.ipv4.as_deref(),
                )
                .await?;
            self.attached
                .lock()
                .insert(cfg.network.clone(), wanted.clone());
        }

        self.netns.shape(CNI_IFNAME, &cfg.default).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::link::testutil::RecordingRunner;
    use super::*;
    use crate::docker::{ContainerSpec, MockContainerApi, NetworkSpec};
    use crate::runner::params::RunParams;
    use crate::sync::{LinkShape, SyncStore};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn plan_container_spec(run_id: &str, total: u32) -> ContainerSpec {
        let params = RunParams {
            plan: "p".to_string(),
            case: "c".to_string(),
            run_id: run_id.to_string(),
            total_instances: total,
            group_id: "all".to_string(),
            group_instance_count: total,
            params: BTreeMap::new(),
            outputs_path: "/outputs".to_string(),
            subnet: "16.0.0.0/16".to_string(),
            sidecar: true,
            start_time: Utc::now(),
            sync_endpoint: "http://192.18.0.1:5050".to_string(),
        };
        let mut labels = BTreeMap::new();
        labels.insert("testground.purpose".to_string(), "plan".to_string());
        labels.insert("testground.run_id".to_string(), run_id.to_string());
        ContainerSpec {
            name: format!("tg-{}-0", run_id),
            image: "img".to_string(),
            env: params
                .to_env()
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels,
            network_mode: Some("testground-control".to_string()),
            ..Default::default()
        }
    }

    fn ip_json_fixture(runner: &RecordingRunner) {
        runner.respond(
            "addr show",
            r#"[
                {"ifname":"eth0","addr_info":[{"local":"192.18.0.4","prefixlen":16}]},
                {"ifname":"eth1","addr_info":[{"local":"16.0.0.3","prefixlen":16}]}
            ]"#,
        );
        runner.respond(
            "route get 192.18.0.1",
            r#"[{"dst":"192.18.0.1","dev":"eth0"}]"#,
        );
        runner.respond("route show dev eth1", r#"[{"dst":"default"}]"#);
    }

    #[tokio::test]
    async fn test_reactor_discovers_and_initialises_plan_container() {
        let api = Arc::new(MockContainerApi::new());
        let store = Arc::new(SyncStore::new());
        let runner = Arc::new(RecordingRunner::new());
        ip_json_fixture(&runner);

        // One plan container, running, for a single-instance run.
        let id = api
            .create_container(&plan_container_spec("r-1", 1))
            .await
            .unwrap();
        api.start_container(&id).await.unwrap();

        let reactor = DockerReactor::new(
            SidecarMode::Docker,
            Arc::clone(&api) as Arc<dyn ContainerApi>,
            Arc::clone(&store) as Arc<dyn SyncApi>,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "http://192.18.0.1:5050".to_string(),
            "/host/opt/cni/bin".to_string(),
        );

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            reactor.run(OutputWriter::discard(), shutdown).await
        });

        // With one instance total, the barrier releases as soon as the
        // sidecar signals; wait on it ourselves to observe the signal.
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            store.barrier("r-1", crate::sync::NETWORK_INITIALIZED_STATE, 1, &token),
        )
        .await
        .expect("sidecar should signal network-initialized")
        .unwrap();

        // The default route on the data link was removed.
        assert!(!runner.calls_matching("route del default dev eth1").is_empty());

        token.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }

    #[tokio::test]
    async fn test_docker_network_shaping_flow() {
        let api = Arc::new(MockContainerApi::new());
        let runner = Arc::new(RecordingRunner::new());
        ip_json_fixture(&runner);

        // Data network for the run.
        let mut labels = BTreeMap::new();
        labels.insert("testground.run_id".to_string(), "r-1".to_string());
        labels.insert("testground.name".to_string(), "default".to_string());
        let net_id = api
            .create_network(&NetworkSpec {
                name: "tg-data".to_string(),
                labels,
                subnet: "16.0.0.0/16".to_string(),
                gateway: "16.0.0.1".to_string(),
                internal: true,
            })
            .await
            .unwrap();

        let ctr_id = api
            .create_container(&plan_container_spec("r-1", 1))
            .await
            .unwrap();
        api.start_container(&ctr_id).await.unwrap();
        api.connect_network(&net_id, &ctr_id).await.unwrap();

        let network = DockerInstanceNetwork {
            api: Arc::clone(&api) as Arc<dyn ContainerApi>,
            netns: Arc::new(NetnsExec::new(
                Arc::clone(&runner) as Arc<dyn CommandRunner>,
                77,
            )),
            container_id: ctr_id.clone(),
            run_id: "r-1".to_string(),
            subnet: "16.0.0.0/16".to_string(),
            active_links: Mutex::new(HashMap::new()),
        };

        // Enable with a latency shape.
        network
            .configure(&NetworkConfig {
                network: "default".to_string(),
                enable: true,
                ipv4: None,
                ipv6: None,
                default: LinkShape {
                    latency_ms: 100,
                    ..Default::default()
                },
                rules: vec![],
                state: "net-up".to_string(),
            })
            .await
            .unwrap();
        assert!(!runner.calls_matching("netem").is_empty());

        // Disable detaches from the data network.
        network
            .configure(&NetworkConfig {
                network: "default".to_string(),
                enable: false,
                ipv4: None,
                ipv6: None,
                default: LinkShape::default(),
                rules: vec![],
                state: "net-down".to_string(),
            })
            .await
            .unwrap();

        let containers = api.containers.lock();
        let c = containers.get(&ctr_id).unwrap();
        assert!(!c.networks.contains_key(&net_id));
    }

    #[tokio::test]
    async fn test_cni_network_reattaches_on_ip_change() {
        let runner = Arc::new(RecordingRunner::new());
        let network = CniInstanceNetwork {
            cni: CniInvoker::new(
                Arc::clone(&runner) as Arc<dyn CommandRunner>,
                "/host/opt/cni/bin",
            ),
            netns: Arc::new(NetnsExec::new(
                Arc::clone(&runner) as Arc<dyn CommandRunner>,
                88,
            )),
            container_id: "ctr-9".to_string(),
            pid: 88,
            subnet: "16.0.0.0/16".to_string(),
            attached: Mutex::new(HashMap::new()),
        };

        let base = NetworkConfig {
            network: "default".to_string(),
            enable: true,
            ipv4: Some("16.0.0.10/16".to_string()),
            ipv6: None,
            default: LinkShape::default(),
            rules: vec![],
            state: "s".to_string(),
        };

        network.configure(&base).await.unwrap();
        assert_eq!(runner.calls_matching("CNI_COMMAND=ADD").len(), 1);

        // Same address: no reattach.
        network.configure(&base).await.unwrap();
        assert_eq!(runner.calls_matching("CNI_COMMAND=ADD").len(), 1);

        // New address: detach then reattach.
        let mut changed = base.clone();
        changed.ipv4 = Some("16.0.0.20/16".to_string());
        network.configure(&changed).await.unwrap();
        assert_eq!(runner.calls_matching("CNI_COMMAND=DEL").len(), 1);
        assert_eq!(runner.calls_matching("CNI_COMMAND=ADD").len(), 2);
    }

    #[tokio::test]
    async fn test_rules_are_rejected() {
        let runner = Arc::new(RecordingRunner::new());
        let network = CniInstanceNetwork {
            cni: CniInvoker::new(
                Arc::clone(&runner) as Arc<dyn CommandRunner>,
                "/host/opt/cni/bin",
            ),
            netns: Arc::new(NetnsExec::new(
                Arc::clone(&runner) as Arc<dyn CommandRunner>,
                88,
            )),
            container_id: "ctr-9".to_string(),
            pid: 88,
            subnet: "16.0.0.0/16".to_string(),
            attached: Mutex::new(HashMap::new()),
        };

        let cfg = NetworkConfig {
            network: "default".to_string(),
            enable: true,
            ipv4: None,
            ipv6: None,
            default: LinkShape::default(),
            rules: vec![crate::sync::LinkRule {
                subnet: "16.1.0.0/16".to_string(),
                shape: LinkShape::default(),
            }],
            state: "s".to_string(),
        };
        assert!(matches!(
            network.configure(&cfg).await,
            Err(SidecarError::Unsupported(_))
        ));
    }
}
