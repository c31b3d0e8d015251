//! Composition data model.
//!
//! A composition is the declarative description of a run: which plan and
//! case to execute, with which builder and runner, partitioned into groups
//! of instances that share a build and a parameter set. An optional list
//! of run entries repeats the composition under varied parameters.
//!
//! The daemon receives compositions as JSON; file formats are the CLI's
//! concern.

mod validation;

pub use validation::CompositionError;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level composition document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Composition {
    pub global: Global,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<RunEntry>,
}

/// Settings that apply to the whole composition unless a group overrides
/// them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Global {
    pub plan: String,
    pub case: String,
    #[serde(default)]
    pub builder: String,
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub total_instances: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub build_config: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub run_config: BTreeMap<String, serde_json::Value>,
}

/// Number of instances in a group: an absolute count or a percentage of
/// the global total, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instances {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub percentage: f64,
}

/// Resource requests for one instance of a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Build settings for a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Build {
    /// Module path -> version overrides applied to the plan build.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

/// Run settings for a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Run {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub test_params: BTreeMap<String, String>,
    /// Artifact handle produced by a builder; opaque to the engine. When
    /// absent, the orchestrator builds before running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// A subset of instances that share a build and a parameter set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub instances: Instances,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<String>,
    #[serde(default)]
    pub build: Build,
    #[serde(default)]
    pub run: Run,
    #[serde(default)]
    pub resources: Resources,
}

/// One entry in the optional run sequence: repeats the composition with
/// parameter overrides per referenced group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunEntry {
    pub id: String,
    #[serde(default)]
    pub groups: Vec<RunEntryGroup>,
}

/// Per-group overrides inside a run entry. `group_id` defaults to `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunEntryGroup {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub test_params: BTreeMap<String, String>,
}

impl RunEntryGroup {
    /// The composition group this entry references.
    pub fn effective_group_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.id)
    }
}

impl Composition {
    /// Returns the group with the given id.
    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// The builder effective for a group: the group override or the
    /// global default.
    pub fn builder_for<'a>(&'a self, group: &'a Group) -> &'a str {
        group.builder.as_deref().unwrap_or(&self.global.builder)
    }
}
