//! Builder abstraction.
//!
//! Builders turn plan sources into opaque artifact handles — an
//! executable path, an image reference — that runners consume. The
//! platform never compiles anything itself: it fingerprints build
//! inputs, delegates to a registered builder, and caches the result so
//! groups with identical build inputs share one artifact.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::rpc::OutputWriter;

/// Builder failures.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown builder: {0}")]
    UnknownBuilder(String),

    #[error("build failed: {0}")]
    Failed(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("plan sources missing: {0}")]
    MissingSources(String),
}

/// Source payloads unpacked from a build request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnpackedSources {
    pub base_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<PathBuf>,
}

/// Input for one build-distinct group set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInput {
    pub plan: String,
    /// Module path -> version overrides.
    pub dependencies: BTreeMap<String, String>,
    /// Merged global + group builder configuration.
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<UnpackedSources>,
}

/// The opaque product of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub handle: String,
}

/// The interface every builder implements. Implementations live outside
/// the core; tests register stubs.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Canonical identifier, e.g. `docker:generic`.
    fn id(&self) -> &'static str;

    /// Produces an artifact from the given input.
    async fn build(
        &self,
        input: &BuildInput,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<BuildArtifact, BuildError>;
}

/// Registry of available builders, keyed by id.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: HashMap<&'static str, Arc<dyn Builder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, builder: Arc<dyn Builder>) {
        self.builders.insert(builder.id(), builder);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Builder>, BuildError> {
        self.builders
            .get(id)
            .cloned()
            .ok_or_else(|| BuildError::UnknownBuilder(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.builders.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Stable fingerprint of a build: SHA-256 over the plan name, builder
/// id, the canonically-ordered dependency map and the canonical JSON of
/// the merged builder configuration. Identical inputs across groups
/// yield identical fingerprints, so their builds coalesce.
pub fn build_fingerprint(
    plan: &str,
    builder_id: &str,
    dependencies: &BTreeMap<String, String>,
    config: &BTreeMap<String, serde_json::Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan.as_bytes());
    hasher.update([0]);
    hasher.update(builder_id.as_bytes());
    hasher.update([0]);
    for (k, v) in dependencies {
        hasher.update(k.as_bytes());
        hasher.update([b'=']);
        hasher.update(v.as_bytes());
        hasher.update([0]);
    }
    // BTreeMap serializes with sorted keys, making the JSON canonical.
    if let Ok(json) = serde_json::to_vec(config) {
        hasher.update(&json);
    }
    format!("{:x}", hasher.finalize())
}
