//! Coordination service.
//!
//! A small set of primitives that let the instances of one run coordinate
//! themselves without a conductor: gap-free counters with barriers,
//! append-only subtree streams with history replay, and a lightweight
//! event namespace. The store lives in the daemon (or the standalone
//! `sync-service` subcommand); instances and sidecars reach it over HTTP
//! through [`SyncClient`], which implements the same [`SyncApi`] trait as
//! the in-process [`SyncStore`].

mod client;
mod service;
mod store;

pub use client::SyncClient;
pub use service::{serve_sync, sync_router};
pub use store::SyncStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Barrier state every sidecar signals once its instance's data links are
/// up. Runners wait on it to detect network readiness.
pub const NETWORK_INITIALIZED_STATE: &str = "network-initialized";

/// Canonical log lines emitted when the data plane comes up (or fails).
/// Kept for operators and log-scraping tooling even though readiness
/// detection rides on the barrier.
pub const NETWORK_INIT_SUCCESSFUL: &str = "network initialisation successful";
pub const NETWORK_INIT_FAILED: &str = "network initialisation failed";

/// Topic on which the sidecar managing `hostname` receives network
/// configuration changes.
pub fn network_topic(hostname: &str) -> String {
    format!("network:{}", hostname)
}

/// Errors surfaced by the coordination primitives.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("sync transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("subscription closed")]
    Closed,
}

/// Traffic shape applied to a link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkShape {
    /// One-way delay in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
    /// Delay variation in milliseconds.
    #[serde(default)]
    pub jitter_ms: u64,
    /// Bandwidth cap in bits per second; 0 leaves bandwidth unshaped.
    #[serde(default)]
    pub bandwidth_bps: u64,
    /// Packet loss percentage.
    #[serde(default)]
    pub loss_pct: f64,
    /// Packet corruption percentage.
    #[serde(default)]
    pub corrupt_pct: f64,
    /// Packet duplication percentage.
    #[serde(default)]
    pub duplicate_pct: f64,
}

impl LinkShape {
    /// True when nothing about the link is shaped.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-subnet shaping rule. Applies `shape` to traffic towards `subnet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRule {
    pub subnet: String,
    #[serde(flatten)]
    pub shape: LinkShape,
}

/// Network configuration message published on a per-hostname topic. The
/// sidecar applies it and acknowledges by signalling the `state` counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Logical network name; the data network is `default`.
    pub network: String,
    /// Attach (true) or detach (false) the instance from the network.
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    /// Shape applied to all traffic on the link.
    #[serde(default)]
    pub default: LinkShape,
    /// Per-subnet overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<LinkRule>,
    /// Counter the sidecar increments once the change has been applied.
    pub state: String,
}

/// A typed, append-only stream scoped to a run.
///
/// The key-extraction function deduplicates keyed emissions (for example
/// peer address records published once per instance).
pub struct Subtree<T> {
    pub key: String,
    pub key_fn: fn(&T) -> String,
}

impl<T: Serialize + serde::de::DeserializeOwned> Subtree<T> {
    pub fn new(key: impl Into<String>, key_fn: fn(&T) -> String) -> Self {
        Self {
            key: key.into(),
            key_fn,
        }
    }
}

/// The coordination primitives, implemented both by the in-process store
/// and by the HTTP client.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Atomically increments the counter for `(run_id, state)` and
    /// returns the new value. Sequences are gap-free and totally ordered
    /// across all signallers.
    async fn signal_entry(&self, run_id: &str, state: &str) -> Result<u64, SyncError>;

    /// Resolves once the counter for `state` reaches `target`; errors if
    /// the token fires first. `target == 0` is satisfied immediately.
    async fn barrier(
        &self,
        run_id: &str,
        state: &str,
        target: u64,
        token: &CancellationToken,
    ) -> Result<(), SyncError>;

    /// Appends a value to the stream `(run_id, topic)`, returning its
    /// 1-based sequence number.
    async fn publish(
        &self,
        run_id: &str,
        topic: &str,
        value: serde_json::Value,
    ) -> Result<u64, SyncError>;

    /// Streams every value ever published to `(run_id, topic)` in write
    /// order, then tails new values until the token fires.
    async fn subscribe(
        &self,
        run_id: &str,
        topic: &str,
        token: &CancellationToken,
    ) -> Result<mpsc::Receiver<serde_json::Value>, SyncError>;

    /// Records a test telemetry event. Same stream mechanics, separate
    /// namespace.
    async fn signal_event(
        &self,
        run_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<u64, SyncError>;

    /// Opportunistic sweep of idle streams and counters. Sidecar nodes
    /// call this after runs wind down; implementations without GC report
    /// zero.
    async fn gc_expired(&self) -> Result<u64, SyncError> {
        Ok(0)
    }
}

/// Typed publish: serializes the payload and appends it to the subtree.
pub async fn publish_typed<T: Serialize + Send + Sync>(
    api: &dyn SyncApi,
    run_id: &str,
    subtree: &Subtree<T>,
    value: &T,
) -> Result<u64, SyncError> {
    api.publish(run_id, &subtree.key, serde_json::to_value(value)?)
        .await
}

/// Typed subscribe: decodes each entry, deduplicating by the subtree's
/// extraction key. Undecodable entries are skipped.
pub async fn subscribe_typed<T>(
    api: &dyn SyncApi,
    run_id: &str,
    subtree: &Subtree<T>,
    token: &CancellationToken,
) -> Result<mpsc::Receiver<T>, SyncError>
where
    T: Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    let mut raw = api.subscribe(run_id, &subtree.key, token).await?;
    let key_fn = subtree.key_fn;
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut seen: BTreeMap<String, ()> = BTreeMap::new();
        while let Some(value) = raw.recv().await {
            let Ok(item) = serde_json::from_value::<T>(value) else {
                continue;
            };
            let key = key_fn(&item);
            if seen.insert(key, ()).is_some() {
                continue;
            }
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_wire_format() {
        let cfg = NetworkConfig {
            network: "default".to_string(),
            enable: true,
            ipv4: Some("16.0.0.2/16".to_string()),
            ipv6: None,
            default: LinkShape {
                latency_ms: 100,
                bandwidth_bps: 1_000_000,
                ..Default::default()
            },
            rules: vec![],
            state: "network-configured".to_string(),
        };

        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["network"], "default");
        assert_eq!(json["default"]["latency_ms"], 100);
        assert!(json.get("ipv6").is_none());

        let back: NetworkConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.state, "network-configured");
        assert_eq!(back.default.bandwidth_bps, 1_000_000);
    }

    #[test]
    fn test_link_shape_noop() {
        assert!(LinkShape::default().is_noop());
        assert!(!LinkShape {
            loss_pct: 1.0,
            ..Default::default()
        }
        .is_noop());
    }

    #[test]
    fn test_network_topic_naming() {
        assert_eq!(network_topic("host-3"), "network:host-3");
    }
}
