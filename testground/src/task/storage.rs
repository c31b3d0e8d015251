//! Durable task store.
//!
//! A single-file embedded database used as an ordered key/value store.
//! Task records live under one of three key prefixes — `queue:`,
//! `current:`, `archive:` — followed by `<unix-ts>_<task-id>`, so range
//! scans enumerate tasks per state in time order while point lookups stay
//! O(1). State transitions are a transactional *move*: read the old key,
//! write the new key, delete the old key, commit. At any instant exactly
//! one prefix holds a task's key, including across restarts.
//!
//! Task progress events are persisted under `events:<task-id>:<seq>` in
//! the same database, giving replayable log streams.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::rpc::Chunk;

use super::{Task, TaskId, TaskState};

/// Prefix for scheduled tasks awaiting a worker.
pub const PREFIX_SCHEDULED: &str = "queue";
/// Prefix for tasks currently being processed.
pub const PREFIX_PROCESSING: &str = "current";
/// Prefix for terminal tasks.
pub const PREFIX_COMPLETE: &str = "archive";

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("task not found")]
    NotFound,

    #[error("task key must embed a creation timestamp: {0}")]
    MalformedId(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

fn prefix_for(state: TaskState) -> &'static str {
    match state {
        TaskState::Scheduled => PREFIX_SCHEDULED,
        TaskState::Processing => PREFIX_PROCESSING,
        TaskState::Complete => PREFIX_COMPLETE,
    }
}

/// Derives the storage key for a task id under a prefix. The timestamp
/// component is recovered from the id itself, so a key can be computed
/// from (prefix, id) alone.
fn task_key(prefix: &str, id: &TaskId) -> Result<String, StorageError> {
    let ts = id
        .created_unix()
        .map_err(|_| StorageError::MalformedId(id.as_str().to_string()))?;
    Ok(format!("{}:{:010}_{}", prefix, ts, id))
}

fn event_key(id: &TaskId, seq: u64) -> String {
    format!("events:{}:{:010}", id, seq)
}

/// Tasks stored in a single sqlite file used as an ordered KV store.
pub struct TaskStorage {
    conn: Mutex<Connection>,
}

impl TaskStorage {
    /// Opens (creating if needed) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory store, for tests and ephemeral daemons.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        // journal_mode returns its new value as a row, so query_row it.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_row| Ok(()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn put(&self, key: &str, task: &Task) -> Result<(), StorageError> {
        let value = serde_json::to_vec(task)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_at(&self, prefix: &str, id: &TaskId) -> Result<Option<Task>, StorageError> {
        let key = task_key(prefix, id)?;
        let conn = self.conn.lock();
        let value: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persists a freshly admitted task under the scheduled prefix.
    pub fn persist_scheduled(&self, task: &Task) -> Result<(), StorageError> {
        self.put(&task_key(PREFIX_SCHEDULED, &task.id)?, task)
    }

    /// Rewrites a processing task in place (progress on outcome fields).
    pub fn update_processing(&self, task: &Task) -> Result<(), StorageError> {
        self.put(&task_key(PREFIX_PROCESSING, &task.id)?, task)
    }

    /// Fetches a task regardless of state, newest states first.
    pub fn get(&self, id: &TaskId) -> Result<Task, StorageError> {
        for prefix in [PREFIX_COMPLETE, PREFIX_PROCESSING, PREFIX_SCHEDULED] {
            if let Some(task) = self.get_at(prefix, id)? {
                return Ok(task);
            }
        }
        Err(StorageError::NotFound)
    }

    /// Atomically moves a task between state prefixes, applying `mutate`
    /// to the stored record inside the same transaction.
    pub fn transition(
        &self,
        id: &TaskId,
        from: TaskState,
        to: TaskState,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task, StorageError> {
        let old_key = task_key(prefix_for(from), id)?;
        let new_key = task_key(prefix_for(to), id)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let value: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![old_key],
                |row| row.get(0),
            )
            .optional()?;
        let bytes = value.ok_or(StorageError::NotFound)?;

        let mut task: Task = serde_json::from_slice(&bytes)?;
        task.state = to;
        mutate(&mut task);
        let updated = serde_json::to_vec(&task)?;

        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![new_key, updated],
        )?;
        tx.execute("DELETE FROM kv WHERE key = ?1", params![old_key])?;
        tx.commit()?;

        Ok(task)
    }

    /// Time-bounded range scan over one state prefix. Bounds are unix
    /// seconds; `end` is exclusive. Results come back in creation order.
    pub fn filter(
        &self,
        state: TaskState,
        start: i64,
        end: i64,
    ) -> Result<Vec<Task>, StorageError> {
        let prefix = prefix_for(state);
        let lower = format!("{}:{:010}", prefix, start.max(0));
        let upper = format!("{}:{:010}", prefix, end.max(0));

        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
        let rows = stmt.query_map(params![lower, upper], |row| row.get::<_, Vec<u8>>(0))?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(serde_json::from_slice(&row?)?);
        }
        Ok(tasks)
    }

    /// Every task under one state prefix, in creation order.
    pub fn list(&self, state: TaskState) -> Result<Vec<Task>, StorageError> {
        self.filter(state, 0, 9_999_999_999)
    }

    /// Removes a task (and its events) from whichever prefix holds it.
    pub fn delete(&self, id: &TaskId) -> Result<(), StorageError> {
        for prefix in [PREFIX_COMPLETE, PREFIX_PROCESSING, PREFIX_SCHEDULED] {
            let key = task_key(prefix, id)?;
            let conn = self.conn.lock();
            let n = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            if n > 0 {
                conn.execute(
                    "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
                    params![format!("events:{}:", id), format!("events:{};", id)],
                )?;
                return Ok(());
            }
        }
        Err(StorageError::NotFound)
    }

    /// Appends one progress chunk to a task's persistent event log.
    pub fn append_event(&self, id: &TaskId, seq: u64, chunk: &Chunk) -> Result<(), StorageError> {
        let value = serde_json::to_vec(chunk)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![event_key(id, seq), value],
        )?;
        Ok(())
    }

    /// Replays a task's persisted events in append order.
    pub fn events(&self, id: &TaskId) -> Result<Vec<Chunk>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
        // ';' sorts directly after ':', closing the per-task event range.
        let rows = stmt.query_map(
            params![format!("events:{}:", id), format!("events:{};", id)],
            |row| row.get::<_, Vec<u8>>(0),
        )?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(serde_json::from_slice(&row?)?);
        }
        Ok(chunks)
    }

    /// Drops archived tasks created before the cutoff. Returns how many
    /// were removed.
    pub fn prune_archive(&self, before_unix: i64) -> Result<usize, StorageError> {
        let expired = self.filter(TaskState::Complete, 0, before_unix)?;
        let count = expired.len();
        for task in &expired {
            self.delete(&task.id)?;
        }
        Ok(count)
    }
}
