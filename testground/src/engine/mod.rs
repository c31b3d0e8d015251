//! Run orchestrator.
//!
//! Converts queued build and run requests into work against builders
//! and runners: validates compositions, coalesces identical builds by
//! fingerprint, assembles the per-group run input, selects a compatible
//! runner, and relays the runner's progress — all under the task
//! engine's cancellation and persistence umbrella.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::builder::{
    build_fingerprint, BuildArtifact, BuildError, BuildInput, BuilderRegistry, UnpackedSources,
};
use crate::composition::{Composition, CompositionError};
use crate::config::EnvConfig;
use crate::healthcheck::HealthcheckReport;
use crate::rpc::OutputWriter;
use crate::runner::{
    CollectionInput, RunGroup, RunInput, RunnerConfig, RunnerError, RunnerRegistry,
};
use crate::sync::SyncStore;
use crate::task::{
    Task, TaskDispatcher, TaskEngine, TaskEngineConfig, TaskError, TaskId, TaskType,
};

/// Orchestrator failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("runner {runner} is incompatible with builder {builder}")]
    IncompatibleRunner { runner: String, builder: String },

    #[error("build previously failed for this input: {0}")]
    CachedBuildFailure(String),

    #[error("malformed task payload: {0}")]
    Payload(String),
}

/// Request to build a composition's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub composition: Composition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<UnpackedSources>,
    #[serde(default)]
    pub priority: i32,
}

/// Request to run a composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub composition: Composition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<UnpackedSources>,
    #[serde(default)]
    pub priority: i32,
}

/// One group's build result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutputEntry {
    pub group_id: String,
    pub artifact: String,
}

enum BuildCacheEntry {
    Built(String),
    Failed(String),
}

struct EngineInner {
    cfg: EnvConfig,
    tasks: TaskEngine,
    runners: RunnerRegistry,
    builders: BuilderRegistry,
    /// Build cache keyed by input fingerprint. Failed builds stay cached
    /// as failed and are never silently reused.
    artifacts: DashMap<String, BuildCacheEntry>,
    sync: Arc<SyncStore>,
}

/// The controller engine: task queue plus orchestration.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        cfg: EnvConfig,
        tasks: TaskEngine,
        runners: RunnerRegistry,
        builders: BuilderRegistry,
        sync: Arc<SyncStore>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cfg,
                tasks,
                runners,
                builders,
                artifacts: DashMap::new(),
                sync,
            }),
        }
    }

    /// Spawns the task workers with this engine as the dispatcher.
    pub fn start(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(self.clone());
        let workers = TaskEngineConfig {
            workers: self.inner.cfg.task_workers,
        };
        self.inner.tasks.start(workers, dispatcher, shutdown)?;
        Ok(())
    }

    pub fn tasks(&self) -> &TaskEngine {
        &self.inner.tasks
    }

    pub fn env(&self) -> &EnvConfig {
        &self.inner.cfg
    }

    pub fn sync_store(&self) -> Arc<SyncStore> {
        Arc::clone(&self.inner.sync)
    }

    /// Admits a build task. Validation failures reject synchronously
    /// without enqueuing anything.
    pub fn queue_build(&self, request: BuildRequest) -> Result<TaskId, EngineError> {
        request.composition.validate_for_build()?;
        for group in &request.composition.groups {
            self.inner
                .builders
                .get(request.composition.builder_for(group))?;
        }

        let plan = request.composition.global.plan.clone();
        let priority = request.priority;
        let payload = serde_json::to_value(&request)
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        Ok(self
            .inner
            .tasks
            .submit(TaskType::Build, priority, plan, None, payload)?)
    }

    /// Admits a run task. Composition and runner compatibility are
    /// validated synchronously.
    pub fn queue_run(&self, request: RunRequest) -> Result<TaskId, EngineError> {
        request.composition.validate_for_run()?;

        let runner = self
            .inner
            .runners
            .get(&request.composition.global.runner)?;
        for group in &request.composition.groups {
            let builder = request.composition.builder_for(group);
            if !runner.compatible_builders().contains(&builder) {
                return Err(EngineError::IncompatibleRunner {
                    runner: runner.id().to_string(),
                    builder: builder.to_string(),
                });
            }
        }

        let plan = request.composition.global.plan.clone();
        let case = request.composition.global.case.clone();
        let priority = request.priority;
        let payload = serde_json::to_value(&request)
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        Ok(self
            .inner
            .tasks
            .submit(TaskType::Run, priority, plan, Some(case), payload)?)
    }

    /// Build phase: one build per distinct fingerprint; groups sharing
    /// inputs share the artifact.
    pub async fn do_build(
        &self,
        composition: &Composition,
        sources: Option<&UnpackedSources>,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<Vec<BuildOutputEntry>, EngineError> {
        // Coalesce groups by fingerprint, preserving group order.
        let mut order: Vec<String> = Vec::new();
        let mut members: BTreeMap<String, Vec<&crate::composition::Group>> = BTreeMap::new();
        for group in &composition.groups {
            let builder_id = composition.builder_for(group);
            let fingerprint = build_fingerprint(
                &composition.global.plan,
                builder_id,
                &group.build.dependencies,
                &composition.global.build_config,
            );
            if !members.contains_key(&fingerprint) {
                order.push(fingerprint.clone());
            }
            members.entry(fingerprint).or_default().push(group);
        }

        let mut outputs = Vec::new();
        for fingerprint in order {
            let groups = &members[&fingerprint];
            let first = groups[0];
            let builder_id = composition.builder_for(first);
            let builder = self.inner.builders.get(builder_id)?;

            let artifact = match self.inner.artifacts.get(&fingerprint).as_deref() {
                Some(BuildCacheEntry::Built(handle)) => {
                    ow.info(
                        "reusing cached artifact",
                        &[("fingerprint", &fingerprint[..12]), ("artifact", handle)],
                    );
                    handle.clone()
                }
                Some(BuildCacheEntry::Failed(err)) => {
                    return Err(EngineError::CachedBuildFailure(err.clone()));
                }
                None => {
                    ow.info(
                        "building artifact",
                        &[("builder", builder_id), ("fingerprint", &fingerprint[..12])],
                    );
                    let input = BuildInput {
                        plan: composition.global.plan.clone(),
                        dependencies: first.build.dependencies.clone(),
                        config: composition.global.build_config.clone(),
                        sources: sources.cloned(),
                    };
                    match builder.build(&input, ow, token).await {
                        Ok(BuildArtifact { handle }) => {
                            self.inner
                                .artifacts
                                .insert(fingerprint.clone(), BuildCacheEntry::Built(handle.clone()));
                            handle
                        }
                        Err(err) => {
                            self.inner.artifacts.insert(
                                fingerprint.clone(),
                                BuildCacheEntry::Failed(err.to_string()),
                            );
                            return Err(err.into());
                        }
                    }
                }
            };

            for group in groups {
                outputs.push(BuildOutputEntry {
                    group_id: group.id.clone(),
                    artifact: artifact.clone(),
                });
            }
        }
        Ok(outputs)
    }

    /// Run phase: ensure artifacts exist, assemble the run input, mint a
    /// run id and delegate to the selected runner.
    pub async fn do_run(
        &self,
        request: &RunRequest,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<serde_json::Value, EngineError> {
        let composition = &request.composition;
        let resolved = composition.validate_for_run()?;

        let runner = self.inner.runners.get(&composition.global.runner)?;
        for group in &composition.groups {
            let builder = composition.builder_for(group);
            if !runner.compatible_builders().contains(&builder) {
                return Err(EngineError::IncompatibleRunner {
                    runner: runner.id().to_string(),
                    builder: builder.to_string(),
                });
            }
        }

        // Build-before-run: no dispatch until every artifact exists.
        let missing: Vec<&str> = composition
            .groups
            .iter()
            .filter(|g| g.run.artifact.is_none())
            .map(|g| g.id.as_str())
            .collect();
        let mut built: BTreeMap<String, String> = BTreeMap::new();
        if !missing.is_empty() {
            ow.info(
                "building artifacts for groups without one",
                &[("groups", &missing.join(","))],
            );
            for entry in self
                .do_build(composition, request.sources.as_ref(), ow, token)
                .await?
            {
                built.insert(entry.group_id, entry.artifact);
            }
        }

        let mut base_groups = Vec::with_capacity(composition.groups.len());
        for (group, instances) in composition.groups.iter().zip(resolved) {
            let artifact = group
                .run
                .artifact
                .clone()
                .or_else(|| built.get(&group.id).cloned())
                .ok_or_else(|| EngineError::Payload(format!("group {} has no artifact", group.id)))?;
            base_groups.push(RunGroup {
                id: group.id.clone(),
                instances,
                artifact,
                parameters: group.run.test_params.clone(),
                resources: group.resources.clone(),
            });
        }

        let config = RunnerConfig::decode(runner.id(), &composition.global.run_config)?;

        // No run sequence: a single execution.
        if composition.runs.is_empty() {
            let output = self
                .execute_once(runner.as_ref(), composition, base_groups, &config, ow, token)
                .await?;
            return Ok(serde_json::to_value(output)
                .map_err(|e| EngineError::Payload(e.to_string()))?);
        }

        // Run sequence: repeat the composition once per entry, applying
        // the entry's parameter overrides to the groups it references.
        let mut results = Vec::with_capacity(composition.runs.len());
        for entry in &composition.runs {
            if token.is_cancelled() {
                return Err(EngineError::Runner(RunnerError::Cancelled));
            }

            let mut groups = base_groups.clone();
            for entry_group in &entry.groups {
                if let Some(group) = groups
                    .iter_mut()
                    .find(|g| g.id == entry_group.effective_group_id())
                {
                    group
                        .parameters
                        .extend(entry_group.test_params.clone());
                }
            }

            ow.info("starting sequenced run", &[("run", &entry.id)]);
            let output = self
                .execute_once(runner.as_ref(), composition, groups, &config, ow, token)
                .await?;
            results.push(serde_json::json!({
                "run": entry.id,
                "run_id": output.run_id,
            }));
        }
        Ok(serde_json::Value::Array(results))
    }

    async fn execute_once(
        &self,
        runner: &dyn crate::runner::Runner,
        composition: &Composition,
        groups: Vec<RunGroup>,
        config: &RunnerConfig,
        ow: &OutputWriter,
        token: &CancellationToken,
    ) -> Result<crate::runner::RunOutput, EngineError> {
        let run_id = new_run_id();
        let log = ow.with(&[("run_id", &run_id)]);

        let input = RunInput {
            run_id,
            plan: composition.global.plan.clone(),
            case: composition.global.case.clone(),
            total_instances: composition.global.total_instances,
            groups,
            config: config.clone(),
        };

        log.info(
            "dispatching run",
            &[
                ("runner", runner.id()),
                ("instances", &input.total_instances.to_string()),
            ],
        );
        Ok(runner.run(&input, &log, token).await?)
    }

    /// Healthcheck passthrough to the named runner.
    pub async fn healthcheck(
        &self,
        runner_id: &str,
        fix: bool,
        ow: &OutputWriter,
    ) -> Result<HealthcheckReport, EngineError> {
        let runner = self.inner.runners.get(runner_id)?;
        Ok(runner.healthcheck(fix, ow).await?)
    }

    /// Streams the output archive for a run.
    pub async fn collect_outputs(
        &self,
        runner_id: &str,
        run_id: &str,
        out: mpsc::Sender<Bytes>,
        ow: &OutputWriter,
    ) -> Result<(), EngineError> {
        let runner = self.inner.runners.get(runner_id)?;
        let input = CollectionInput {
            run_id: run_id.to_string(),
            runner: runner_id.to_string(),
        };
        Ok(runner.collect_outputs(&input, out, ow).await?)
    }

    /// Tears down everything a runner manages.
    pub async fn terminate(&self, runner_id: &str, ow: &OutputWriter) -> Result<(), EngineError> {
        let runner = self.inner.runners.get(runner_id)?;
        Ok(runner.terminate_all(ow).await?)
    }
}

fn new_run_id() -> String {
    format!("r{}", uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl TaskDispatcher for Engine {
    async fn dispatch(
        &self,
        task: &Task,
        ow: &OutputWriter,
        token: CancellationToken,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        match task.task_type {
            TaskType::Build => {
                let request: BuildRequest = serde_json::from_value(task.input.clone())
                    .map_err(|e| EngineError::Payload(e.to_string()))?;
                let outputs = self
                    .do_build(
                        &request.composition,
                        request.sources.as_ref(),
                        ow,
                        &token,
                    )
                    .await?;
                Ok(serde_json::to_value(outputs)?)
            }
            TaskType::Run => {
                let request: RunRequest = serde_json::from_value(task.input.clone())
                    .map_err(|e| EngineError::Payload(e.to_string()))?;
                Ok(self.do_run(&request, ow, &token).await?)
            }
        }
    }
}
