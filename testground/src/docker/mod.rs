//! Container daemon API abstraction.
//!
//! The container runner and the sidecar talk to the local container
//! daemon through the [`ContainerApi`] trait. The real implementation
//! ([`HttpContainerApi`]) speaks the engine REST API over reqwest; tests
//! inject a mock. This abstraction allows dependency injection and
//! keeps every caller testable without a daemon.

mod http;

pub use http::HttpContainerApi;

#[cfg(test)]
pub use mock::MockContainerApi;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from the container daemon.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("container daemon request failed: {0}")]
    Http(String),

    #[error("container daemon returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// A ulimit applied to a container, e.g. `nofile=1048576:1048576`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    /// Parses the `name=soft:hard` syntax.
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, limits) = raw.split_once('=')?;
        let (soft, hard) = limits.split_once(':')?;
        Some(Self {
            name: name.to_string(),
            soft: soft.parse().ok()?,
            hard: hard.parse().ok()?,
        })
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// Network the container starts attached to.
    pub network_mode: Option<String>,
    /// Host bind mounts, `host:container` syntax.
    pub binds: Vec<String>,
    pub ulimits: Vec<Ulimit>,
    pub publish_all_ports: bool,
    pub cap_add: Vec<String>,
    pub pid_mode: Option<String>,
    pub restart_policy: Option<String>,
    pub sysctls: BTreeMap<String, String>,
}

/// Bridge network creation parameters.
#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub subnet: String,
    pub gateway: String,
    /// Internal networks carry no outbound route.
    pub internal: bool,
}

/// Summary row from a container listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub state: String,
}

/// Attachment details of one network inside an inspect result.
#[derive(Debug, Clone, Default)]
pub struct ContainerNetwork {
    pub network_id: String,
    pub ip_address: String,
}

/// Inspect result for one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub pid: i64,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub hostname: String,
    pub networks: BTreeMap<String, ContainerNetwork>,
}

/// Summary row from a network listing.
#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Filters for container listings.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilters {
    pub labels: Vec<String>,
    pub names: Vec<String>,
}

impl ContainerFilters {
    pub fn by_label(label: impl Into<String>) -> Self {
        Self {
            labels: vec![label.into()],
            names: Vec::new(),
        }
    }

    pub fn by_names<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self {
            labels: Vec::new(),
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One demultiplexed container log line.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// The container daemon operations the platform needs.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn ping(&self) -> Result<(), DockerError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;
    async fn start_container(&self, id: &str) -> Result<(), DockerError>;
    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, DockerError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError>;
    async fn list_containers(
        &self,
        filters: &ContainerFilters,
        all: bool,
    ) -> Result<Vec<ContainerSummary>, DockerError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, DockerError>;

    /// Streams demultiplexed log lines; with `follow`, the stream stays
    /// open until the container stops or the receiver is dropped.
    async fn container_logs(
        &self,
        id: &str,
        follow: bool,
    ) -> Result<mpsc::Receiver<LogLine>, DockerError>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, DockerError>;
    async fn remove_network(&self, id: &str) -> Result<(), DockerError>;
    async fn connect_network(&self, network: &str, container: &str) -> Result<(), DockerError>;
    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), DockerError>;
    async fn list_networks(
        &self,
        label_filter: Option<&str>,
    ) -> Result<Vec<NetworkSummary>, DockerError>;
}

#[cfg(test)]
mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    pub struct MockContainer {
        pub id: String,
        pub spec: ContainerSpec,
        pub running: bool,
        pub pid: i64,
        pub exit_code: i64,
        pub networks: BTreeMap<String, ContainerNetwork>,
    }

    /// Programmable in-memory container daemon for tests.
    #[derive(Default)]
    pub struct MockContainerApi {
        counter: AtomicU64,
        pub containers: Mutex<BTreeMap<String, MockContainer>>,
        pub networks: Mutex<BTreeMap<String, NetworkSpec>>,
        /// Names for which create_container fails.
        pub fail_creates: Mutex<Vec<String>>,
        /// Log lines served for any container.
        pub logs: Mutex<Vec<LogLine>>,
    }

    impl MockContainerApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn running_ids(&self) -> Vec<String> {
            self.containers
                .lock()
                .values()
                .filter(|c| c.running)
                .map(|c| c.id.clone())
                .collect()
        }

        /// Marks a container as exited with the given code, releasing any
        /// waiter.
        pub fn finish(&self, id: &str, exit_code: i64) {
            if let Some(c) = self.containers.lock().get_mut(id) {
                c.running = false;
                c.exit_code = exit_code;
            }
        }

        /// Marks every running container as exited with the given code.
        pub fn finish_all(&self, exit_code: i64) {
            for c in self.containers.lock().values_mut() {
                if c.running {
                    c.running = false;
                    c.exit_code = exit_code;
                }
            }
        }
    }

    #[async_trait]
    impl ContainerApi for MockContainerApi {
        async fn ping(&self) -> Result<(), DockerError> {
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
            if self.fail_creates.lock().contains(&spec.name) {
                return Err(DockerError::Api {
                    status: 500,
                    message: format!("injected failure for {}", spec.name),
                });
            }
            let id = format!("ctr-{}", self.counter.fetch_add(1, Ordering::Relaxed));
            let mut networks = BTreeMap::new();
            if let Some(mode) = &spec.network_mode {
                networks.insert(
                    mode.clone(),
                    ContainerNetwork {
                        network_id: mode.clone(),
                        ip_address: "192.18.0.10".to_string(),
                    },
                );
            }
            self.containers.lock().insert(
                id.clone(),
                MockContainer {
                    id: id.clone(),
                    spec: spec.clone(),
                    running: false,
                    pid: 4242,
                    exit_code: 0,
                    networks,
                },
            );
            Ok(id)
        }

        async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
            loop {
                {
                    let containers = self.containers.lock();
                    match containers.get(id) {
                        Some(c) if !c.running => return Ok(c.exit_code),
                        Some(_) => {}
                        None => return Err(DockerError::NotFound(id.to_string())),
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        async fn start_container(&self, id: &str) -> Result<(), DockerError> {
            let mut containers = self.containers.lock();
            let c = containers
                .get_mut(id)
                .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
            c.running = true;
            Ok(())
        }

        async fn remove_container(&self, id: &str, _force: bool) -> Result<(), DockerError> {
            self.containers
                .lock()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| DockerError::NotFound(id.to_string()))
        }

        async fn list_containers(
            &self,
            filters: &ContainerFilters,
            all: bool,
        ) -> Result<Vec<ContainerSummary>, DockerError> {
            let containers = self.containers.lock();
            let mut out = Vec::new();
            for c in containers.values() {
                if !all && !c.running {
                    continue;
                }
                let matches_labels = filters.labels.iter().all(|f| {
                    match f.split_once('=') {
                        Some((k, v)) => c.spec.labels.get(k).map(|x| x == v).unwrap_or(false),
                        None => c.spec.labels.contains_key(f.as_str()),
                    }
                });
                let matches_names = filters.names.is_empty()
                    || filters.names.iter().any(|n| c.spec.name.contains(n));
                if matches_labels && matches_names {
                    out.push(ContainerSummary {
                        id: c.id.clone(),
                        names: vec![format!("/{}", c.spec.name)],
                        labels: c.spec.labels.clone(),
                        state: if c.running { "running" } else { "created" }.to_string(),
                    });
                }
            }
            Ok(out)
        }

        async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, DockerError> {
            let containers = self.containers.lock();
            let c = containers
                .get(id)
                .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
            Ok(ContainerInfo {
                id: c.id.clone(),
                running: c.running,
                pid: c.pid,
                env: c.spec.env.clone(),
                labels: c.spec.labels.clone(),
                hostname: c.spec.name.clone(),
                networks: c.networks.clone(),
            })
        }

        async fn container_logs(
            &self,
            _id: &str,
            _follow: bool,
        ) -> Result<mpsc::Receiver<LogLine>, DockerError> {
            let (tx, rx) = mpsc::channel(64);
            let lines = self.logs.lock().clone();
            tokio::spawn(async move {
                for line in lines {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }

        async fn create_network(&self, spec: &NetworkSpec) -> Result<String, DockerError> {
            let id = format!("net-{}", self.counter.fetch_add(1, Ordering::Relaxed));
            self.networks.lock().insert(id.clone(), spec.clone());
            Ok(id)
        }

        async fn remove_network(&self, id: &str) -> Result<(), DockerError> {
            self.networks
                .lock()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| DockerError::NotFound(id.to_string()))
        }

        async fn connect_network(&self, network: &str, container: &str) -> Result<(), DockerError> {
            let networks = self.networks.lock();
            let spec = networks
                .get(network)
                .ok_or_else(|| DockerError::NotFound(network.to_string()))?;
            let subnet_prefix = spec
                .subnet
                .split('.')
                .take(2)
                .collect::<Vec<_>>()
                .join(".");
            drop(networks);

            let mut containers = self.containers.lock();
            let c = containers
                .get_mut(container)
                .ok_or_else(|| DockerError::NotFound(container.to_string()))?;
            c.networks.insert(
                network.to_string(),
                ContainerNetwork {
                    network_id: network.to_string(),
                    ip_address: format!("{}.0.10", subnet_prefix),
                },
            );
            Ok(())
        }

        async fn disconnect_network(
            &self,
            network: &str,
            container: &str,
            _force: bool,
        ) -> Result<(), DockerError> {
            let mut containers = self.containers.lock();
            let c = containers
                .get_mut(container)
                .ok_or_else(|| DockerError::NotFound(container.to_string()))?;
            c.networks.remove(network);
            Ok(())
        }

        async fn list_networks(
            &self,
            label_filter: Option<&str>,
        ) -> Result<Vec<NetworkSummary>, DockerError> {
            let networks = self.networks.lock();
            Ok(networks
                .iter()
                .filter(|(_, spec)| match label_filter {
                    Some(f) => match f.split_once('=') {
                        Some((k, v)) => spec.labels.get(k).map(|x| x == v).unwrap_or(false),
                        None => spec.labels.contains_key(f),
                    },
                    None => true,
                })
                .map(|(id, spec)| NetworkSummary {
                    id: id.clone(),
                    name: spec.name.clone(),
                    labels: spec.labels.clone(),
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulimit_parsing() {
        let u = Ulimit::parse("nofile=1048576:1048576").unwrap();
        assert_eq!(u.name, "nofile");
        assert_eq!(u.soft, 1048576);
        assert_eq!(u.hard, 1048576);

        assert!(Ulimit::parse("nofile").is_none());
        assert!(Ulimit::parse("nofile=a:b").is_none());
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let api = MockContainerApi::new();
        let spec = ContainerSpec {
            name: "tg-test".to_string(),
            image: "img".to_string(),
            ..Default::default()
        };

        let id = api.create_container(&spec).await.unwrap();
        assert!(api
            .list_containers(&ContainerFilters::default(), false)
            .await
            .unwrap()
            .is_empty());

        api.start_container(&id).await.unwrap();
        assert_eq!(
            api.list_containers(&ContainerFilters::default(), false)
                .await
                .unwrap()
                .len(),
            1
        );

        api.remove_container(&id, true).await.unwrap();
        assert!(matches!(
            api.inspect_container(&id).await,
            Err(DockerError::NotFound(_))
        ));
    }
}
