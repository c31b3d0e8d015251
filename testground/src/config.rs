//! Daemon environment configuration.
//!
//! The daemon keeps all of its state under a single home directory
//! (default `~/.testground`): the task database, run outputs, and the
//! scratch space where incoming request payloads are unpacked. The CLI
//! front-end owns file parsing; the daemon only ever sees JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default daemon listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8042";

/// Default coordination service listen address.
pub const DEFAULT_SYNC_LISTEN_ADDR: &str = "0.0.0.0:5050";

/// Accessors for the directories the daemon manages.
#[derive(Debug, Clone)]
pub struct Directories {
    home: PathBuf,
}

impl Directories {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Root of collected run outputs: `<home>/outputs/<runner>/...`.
    pub fn outputs(&self) -> PathBuf {
        self.home.join("outputs")
    }

    /// Scratch space for unpacked request payloads.
    pub fn work(&self) -> PathBuf {
        self.home.join("work")
    }

    /// Location of the task database.
    pub fn data(&self) -> PathBuf {
        self.home.join("data")
    }

    /// Creates every managed directory that does not exist yet.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.outputs())?;
        std::fs::create_dir_all(self.work())?;
        std::fs::create_dir_all(self.data())?;
        Ok(())
    }
}

/// Environment configuration for the daemon process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Daemon home directory.
    pub home: PathBuf,

    /// HTTP listen address for the daemon surface.
    pub listen: String,

    /// HTTP listen address for the coordination service.
    pub sync_listen: String,

    /// Endpoint at which instances and sidecars reach the coordination
    /// service. Container-based runners inject this into the instance
    /// environment, so it must be resolvable from inside the data plane.
    pub sync_endpoint: String,

    /// Number of concurrent task workers.
    pub task_workers: usize,

    /// Container daemon endpoint (engine REST API over TCP).
    pub docker_endpoint: String,

    /// Cluster API server endpoint and credentials.
    pub cluster: ClusterConfig,
}

/// Connection settings for the cluster pod runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub endpoint: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://127.0.0.1:6443".to_string(),
            namespace: "default".to_string(),
            bearer_token: None,
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        let home = dirs_home().join(".testground");
        Self {
            home,
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            sync_listen: DEFAULT_SYNC_LISTEN_ADDR.to_string(),
            sync_endpoint: format!("http://127.0.0.1:{}", default_sync_port()),
            task_workers: 2,
            docker_endpoint: std::env::var("DOCKER_HOST")
                .unwrap_or_else(|_| "http://127.0.0.1:2375".to_string()),
            cluster: ClusterConfig::default(),
        }
    }
}

impl EnvConfig {
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn dirs(&self) -> Directories {
        Directories::new(&self.home)
    }
}

fn default_sync_port() -> u16 {
    DEFAULT_SYNC_LISTEN_ADDR
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5050)
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
