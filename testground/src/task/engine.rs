//! Task engine: queue, persist, dispatch, stream.
//!
//! A bounded worker pool pulls scheduled tasks in (priority desc, created
//! asc) order and hands them to a [`TaskDispatcher`]. Each state
//! transition is an atomic prefix move in storage, every progress event is
//! persisted *and* broadcast to live subscribers, and cancellation is
//! cooperative via a per-task `CancellationToken`.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::rpc::{Chunk, EventSink, OutputWriter};

use super::queue::{QueuedTask, TaskQueue};
use super::storage::TaskStorage;
use super::{Task, TaskError, TaskId, TaskOutcome, TaskState, TaskType};

/// Capacity of the per-task live event fanout. Slow subscribers that lag
/// behind this many chunks miss events (they can re-subscribe to replay).
const EVENT_FANOUT_CAPACITY: usize = 512;

/// Work executor plugged into the engine. The engine owns lifecycle and
/// persistence; the dispatcher interprets the task payload.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Performs the task, streaming progress through `ow`. Returning `Ok`
    /// yields a Success outcome with the value as the task result;
    /// returning `Err` yields Failure (or Cancelled when the token fired).
    async fn dispatch(
        &self,
        task: &Task,
        ow: &OutputWriter,
        token: CancellationToken,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>;
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    /// Number of concurrent workers.
    pub workers: usize,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

struct LiveTask {
    token: CancellationToken,
    events: broadcast::Sender<Chunk>,
}

struct Inner {
    storage: Arc<TaskStorage>,
    queue: parking_lot::Mutex<TaskQueue>,
    /// Scheduled tasks cancelled before a worker claimed them; skipped at
    /// pop time.
    cancelled: parking_lot::Mutex<HashSet<TaskId>>,
    live: parking_lot::Mutex<HashMap<TaskId, LiveTask>>,
    notify: Notify,
}

/// Sink that persists every chunk to the task's event log and fans it out
/// to live subscribers.
struct TaskSink {
    storage: Arc<TaskStorage>,
    id: TaskId,
    index: AtomicU64,
    events: broadcast::Sender<Chunk>,
}

impl EventSink for TaskSink {
    fn emit(&self, chunk: Chunk) {
        let idx = self.index.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.storage.append_event(&self.id, idx, &chunk) {
            error!(task = %self.id, %err, "failed to persist task event");
        }
        let _ = self.events.send(chunk);
    }
}

/// The durable, priority-ordered work queue.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<Inner>,
}

impl TaskEngine {
    pub fn new(storage: Arc<TaskStorage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                queue: parking_lot::Mutex::new(TaskQueue::new()),
                cancelled: parking_lot::Mutex::new(HashSet::new()),
                live: parking_lot::Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Recovers persisted state and spawns the worker pool. Returns the
    /// worker join handles; they exit when `shutdown` fires.
    pub fn start(
        &self,
        config: TaskEngineConfig,
        dispatcher: Arc<dyn TaskDispatcher>,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, TaskError> {
        self.recover()?;

        let mut handles = Vec::with_capacity(config.workers);
        for worker in 0..config.workers {
            let engine = self.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker, dispatcher, shutdown).await;
            }));
        }
        Ok(handles)
    }

    /// Startup recovery: scheduled tasks re-enter the queue; tasks caught
    /// mid-processing are requeued when idempotently restartable (builds)
    /// or archived as failed (runs).
    fn recover(&self) -> Result<(), TaskError> {
        let storage = &self.inner.storage;

        for task in storage.list(TaskState::Processing)? {
            match task.task_type {
                TaskType::Build => {
                    info!(task = %task.id, "requeueing interrupted build task");
                    storage.transition(
                        &task.id,
                        TaskState::Processing,
                        TaskState::Scheduled,
                        |_| {},
                    )?;
                }
                TaskType::Run => {
                    warn!(task = %task.id, "archiving run task interrupted by restart");
                    storage.transition(
                        &task.id,
                        TaskState::Processing,
                        TaskState::Complete,
                        |t| {
                            t.outcome = Some(TaskOutcome::Failure);
                            t.error = Some("daemon restarted while task was processing".to_string());
                        },
                    )?;
                }
            }
        }

        let mut queue = self.inner.queue.lock();
        for task in storage.list(TaskState::Scheduled)? {
            queue.push(QueuedTask::from(&task));
        }
        drop(queue);

        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Admits a task. The record is persisted before the id is returned;
    /// validation failures happen before this is ever called.
    pub fn submit(
        &self,
        task_type: TaskType,
        priority: i32,
        plan: impl Into<String>,
        case: Option<String>,
        input: serde_json::Value,
    ) -> Result<TaskId, TaskError> {
        let task = Task::new(task_type, priority, plan, case, input);
        self.inner.storage.persist_scheduled(&task)?;
        self.inner.queue.lock().push(QueuedTask::from(&task));
        self.inner.notify.notify_one();
        Ok(task.id)
    }

    /// Latest snapshot of a task.
    pub fn status(&self, id: &TaskId) -> Result<Task, TaskError> {
        match self.inner.storage.get(id) {
            Ok(task) => Ok(task),
            Err(super::StorageError::NotFound) => Err(TaskError::NotFound(id.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Range-scan listing. `state == None` lists every state.
    pub fn list(
        &self,
        state: Option<TaskState>,
        start: i64,
        end: i64,
    ) -> Result<Vec<Task>, TaskError> {
        let states = match state {
            Some(s) => vec![s],
            None => vec![
                TaskState::Scheduled,
                TaskState::Processing,
                TaskState::Complete,
            ],
        };
        let mut out = Vec::new();
        for s in states {
            out.extend(self.inner.storage.filter(s, start, end)?);
        }
        Ok(out)
    }

    /// Contiguous event stream for a task: replays persisted events, then
    /// (with `follow`) tails live ones until the terminal chunk.
    pub fn logs(
        &self,
        id: &TaskId,
        follow: bool,
    ) -> Result<mpsc::UnboundedReceiver<Chunk>, TaskError> {
        let task = self.status(id)?;

        // Subscribe to the live stream before replaying history so no
        // chunk emitted during the replay is lost.
        let live_rx = self
            .inner
            .live
            .lock()
            .get(id)
            .map(|l| l.events.subscribe());

        let history = self.inner.storage.events(id)?;
        let history_len = history.len();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut last_seq: Option<u64> = None;
        let mut saw_terminal = false;
        for chunk in history {
            if let Some(seq) = chunk.seq() {
                last_seq = Some(seq);
            }
            saw_terminal = chunk.is_terminal();
            if tx.send(chunk).is_err() {
                return Ok(rx);
            }
        }

        if !follow || saw_terminal || task.is_terminal() {
            return Ok(rx);
        }

        if let Some(mut live_rx) = live_rx {
            tokio::spawn(async move {
                loop {
                    match live_rx.recv().await {
                        Ok(chunk) => {
                            if let Some(seq) = chunk.seq() {
                                if last_seq.is_some_and(|l| seq <= l) {
                                    continue;
                                }
                            }
                            let terminal = chunk.is_terminal();
                            if tx.send(chunk).is_err() || terminal {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "task log subscriber lagging; chunks dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        } else {
            // The task has not been claimed yet: no live stream exists.
            // Every event is persisted before it is broadcast, so tailing
            // the stored log is equivalent; poll until the terminal
            // chunk lands.
            let engine = self.clone();
            let id = id.clone();
            let mut sent = history_len;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    let events = match engine.inner.storage.events(&id) {
                        Ok(events) => events,
                        Err(_) => return,
                    };
                    let mut terminal = false;
                    for chunk in events.into_iter().skip(sent) {
                        sent += 1;
                        terminal = chunk.is_terminal();
                        if tx.send(chunk).is_err() {
                            return;
                        }
                        if terminal {
                            break;
                        }
                    }
                    if terminal {
                        return;
                    }
                }
            });
        }

        Ok(rx)
    }

    /// Cooperative cancel. Terminal tasks are untouched.
    pub fn cancel(&self, id: &TaskId) -> Result<(), TaskError> {
        let task = self.status(id)?;
        match task.state {
            TaskState::Complete => {
                info!(task = %id, "cancel requested for terminal task; ignoring");
                Ok(())
            }
            TaskState::Processing => {
                if let Some(live) = self.inner.live.lock().get(id) {
                    live.token.cancel();
                }
                Ok(())
            }
            TaskState::Scheduled => {
                self.inner.cancelled.lock().insert(id.clone());
                self.inner.storage.transition(
                    id,
                    TaskState::Scheduled,
                    TaskState::Complete,
                    |t| {
                        t.outcome = Some(TaskOutcome::Cancelled);
                        t.error = Some("task cancelled before processing".to_string());
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Removes an archived task and its event log.
    pub fn delete(&self, id: &TaskId) -> Result<(), TaskError> {
        let task = self.status(id)?;
        if !task.is_terminal() {
            return Err(TaskError::NotCancellable(id.clone(), task.state));
        }
        self.inner.storage.delete(id)?;
        Ok(())
    }

    /// Drops archived tasks older than the retention window.
    pub fn prune_archive(&self, before_unix: i64) -> Result<usize, TaskError> {
        Ok(self.inner.storage.prune_archive(before_unix)?)
    }

    fn next_scheduled(&self) -> Option<QueuedTask> {
        let mut queue = self.inner.queue.lock();
        let mut cancelled = self.inner.cancelled.lock();
        while let Some(entry) = queue.pop() {
            if cancelled.remove(&entry.id) {
                continue;
            }
            return Some(entry);
        }
        None
    }

    async fn worker_loop(
        &self,
        worker: usize,
        dispatcher: Arc<dyn TaskDispatcher>,
        shutdown: CancellationToken,
    ) {
        info!(worker, "task worker started");
        loop {
            while let Some(entry) = self.next_scheduled() {
                self.process(&entry.id, dispatcher.as_ref(), &shutdown).await;
                if shutdown.is_cancelled() {
                    break;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker, "task worker shutting down");
                    return;
                }
                _ = self.inner.notify.notified() => {}
            }
        }
    }

    async fn process(
        &self,
        id: &TaskId,
        dispatcher: &dyn TaskDispatcher,
        shutdown: &CancellationToken,
    ) {
        let task = match self.inner.storage.transition(
            id,
            TaskState::Scheduled,
            TaskState::Processing,
            |_| {},
        ) {
            Ok(task) => task,
            Err(super::StorageError::NotFound) => return, // cancelled under us
            Err(err) => {
                error!(task = %id, %err, "failed to claim task");
                return;
            }
        };

        let token = shutdown.child_token();
        let (events_tx, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);

        // Resume the event index where a previous incarnation left off so
        // requeued builds never overwrite their history.
        let start_index = match self.inner.storage.events(id) {
            Ok(events) => events.len() as u64,
            Err(_) => 0,
        };

        let sink = Arc::new(TaskSink {
            storage: Arc::clone(&self.inner.storage),
            id: id.clone(),
            index: AtomicU64::new(start_index),
            events: events_tx.clone(),
        });
        let ow = OutputWriter::with_start(sink, start_index)
            .with(&[("task_id", id.as_str())]);

        self.inner.live.lock().insert(
            id.clone(),
            LiveTask {
                token: token.clone(),
                events: events_tx,
            },
        );

        ow.info(
            "task picked up by worker",
            &[("type", &task.task_type.to_string())],
        );

        let outcome = dispatcher.dispatch(&task, &ow, token.clone()).await;

        let (terminal, error_msg, result) = match outcome {
            _ if token.is_cancelled() => {
                ow.write_error("task cancelled", &[]);
                (
                    TaskOutcome::Cancelled,
                    Some("task cancelled".to_string()),
                    None,
                )
            }
            Ok(value) => {
                ow.write_result(value.clone());
                (TaskOutcome::Success, None, Some(value))
            }
            Err(err) => {
                let msg = err.to_string();
                ow.write_error(&msg, &[]);
                (TaskOutcome::Failure, Some(msg), None)
            }
        };

        if let Err(err) = self.inner.storage.transition(
            id,
            TaskState::Processing,
            TaskState::Complete,
            |t| {
                t.outcome = Some(terminal);
                t.error = error_msg.clone();
                t.result = result.clone();
            },
        ) {
            error!(task = %id, %err, "failed to archive task");
        }

        self.inner.live.lock().remove(id);
    }
}
