//! Durable task model and engine.
//!
//! A task is a unit of queued work — a build or a run — tracked from
//! submission to completion. Tasks survive daemon restarts: the store
//! (see [`storage`]) keeps each task under exactly one state prefix, and
//! transitions are transactional moves between prefixes.
//!
//! # Architecture
//!
//! ```text
//! submit ──► queue: (scheduled) ──► current: (processing) ──► archive:
//!               │                        │
//!               ▼                        ▼
//!         in-memory heap          worker + dispatcher
//!        (priority, created)      (cancellable, streaming)
//! ```

mod engine;
mod queue;
pub mod storage;

pub use engine::{TaskDispatcher, TaskEngine, TaskEngineConfig};
pub use queue::{QueuedTask, TaskQueue};
pub use storage::{StorageError, TaskStorage};

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the task engine.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {0} is not cancellable in state {1:?}")]
    NotCancellable(TaskId, TaskState),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("malformed task id: {0}")]
    MalformedId(String),
}

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Build,
    Run,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Build => write!(f, "build"),
            TaskType::Run => write!(f, "run"),
        }
    }
}

/// Lifecycle state. A task is in exactly one state, and the store keeps
/// it under the matching key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Scheduled,
    Processing,
    Complete,
}

/// Terminal outcome of a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Failure,
    Cancelled,
}

/// Opaque, time-sortable task identifier.
///
/// The first ten characters are the zero-padded creation time in unix
/// seconds, so ids sort lexicographically by creation time and the
/// storage key can be derived from the id alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

static TASK_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

impl TaskId {
    /// Generates a fresh id for a task created now.
    pub fn generate() -> Self {
        let now = Utc::now();
        let secs = now.timestamp().max(0) as u64;
        let millis = now.timestamp_subsec_millis();
        let counter = TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff;
        let entropy: u16 = rand::random();
        Self(format!(
            "{:010}{:03}{:04x}{:04x}",
            secs, millis, counter, entropy
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time in unix seconds, recovered from the id.
    pub fn created_unix(&self) -> Result<i64, TaskError> {
        if self.0.len() < 10 {
            return Err(TaskError::MalformedId(self.0.clone()));
        }
        self.0[..10]
            .parse::<i64>()
            .map_err(|_| TaskError::MalformedId(self.0.clone()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: i32,
    pub created: DateTime<Utc>,
    pub state: TaskState,
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<String>,
    /// Opaque input payload the dispatcher interprets (a build or run
    /// request).
    pub input: serde_json::Value,
    /// Terminal outcome, set when `state == Complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    /// Terminal error message for failed/cancelled tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Terminal result payload for successful tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(
        task_type: TaskType,
        priority: i32,
        plan: impl Into<String>,
        case: Option<String>,
        input: serde_json::Value,
    ) -> Self {
        let id = TaskId::generate();
        let created = id
            .created_unix()
            .ok()
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
            .unwrap_or_else(Utc::now);
        Self {
            id,
            task_type,
            priority,
            created,
            state: TaskState::Scheduled,
            plan: plan.into(),
            case,
            input,
            outcome: None,
            error: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == TaskState::Complete
    }
}
