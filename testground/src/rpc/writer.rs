//! Output writer: fans progress out to sinks and the tracing log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::chunk::{Chunk, ChunkError, ProgressLevel, ProgressRecord};

/// Destination for the chunks an [`OutputWriter`] produces.
///
/// Implementations must not block: sinks are invoked from async context on
/// every progress line. The task engine's sink persists and broadcasts;
/// the daemon's sink forwards into an HTTP response channel.
pub trait EventSink: Send + Sync {
    fn emit(&self, chunk: Chunk);
}

/// Sink that forwards chunks into an mpsc channel, dropping them when the
/// receiver has gone away (client disconnected).
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Chunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, chunk: Chunk) {
        let _ = self.tx.send(chunk);
    }
}

/// Sink that discards everything; used in tests and fire-and-forget
/// paths.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _chunk: Chunk) {}
}

/// Writer for one progress stream.
///
/// Every record receives a monotonic sequence number and is mirrored to
/// the process log via `tracing` in addition to the sink, so operators
/// see the same stream clients do.
#[derive(Clone)]
pub struct OutputWriter {
    sink: Arc<dyn EventSink>,
    seq: Arc<AtomicU64>,
    base: BTreeMap<String, String>,
}

impl OutputWriter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            seq: Arc::new(AtomicU64::new(0)),
            base: BTreeMap::new(),
        }
    }

    /// Writer that drops all output.
    pub fn discard() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Writer whose sequence numbering starts at `seq`. Used when a
    /// stream resumes on top of persisted history.
    pub fn with_start(sink: Arc<dyn EventSink>, seq: u64) -> Self {
        Self {
            sink,
            seq: Arc::new(AtomicU64::new(seq)),
            base: BTreeMap::new(),
        }
    }

    /// Returns a child writer sharing the same stream and sequence, with
    /// extra fields attached to every record.
    pub fn with(&self, fields: &[(&str, &str)]) -> OutputWriter {
        let mut base = self.base.clone();
        for (k, v) in fields {
            base.insert((*k).to_string(), (*v).to_string());
        }
        Self {
            sink: Arc::clone(&self.sink),
            seq: Arc::clone(&self.seq),
            base,
        }
    }

    fn record(&self, level: ProgressLevel, message: &str, fields: &[(&str, &str)]) {
        let mut merged = self.base.clone();
        for (k, v) in fields {
            merged.insert((*k).to_string(), (*v).to_string());
        }

        match level {
            ProgressLevel::Debug => debug!(target: "testground::progress", "{} {:?}", message, merged),
            ProgressLevel::Info => info!(target: "testground::progress", "{} {:?}", message, merged),
            ProgressLevel::Warn => warn!(target: "testground::progress", "{} {:?}", message, merged),
            ProgressLevel::Error => error!(target: "testground::progress", "{} {:?}", message, merged),
        }

        let rec = ProgressRecord {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            ts: Utc::now(),
            level,
            message: message.to_string(),
            fields: merged,
        };
        self.sink.emit(Chunk::Progress(rec));
    }

    pub fn debug(&self, message: &str, fields: &[(&str, &str)]) {
        self.record(ProgressLevel::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: &[(&str, &str)]) {
        self.record(ProgressLevel::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[(&str, &str)]) {
        self.record(ProgressLevel::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: &[(&str, &str)]) {
        self.record(ProgressLevel::Error, message, fields);
    }

    /// Emits the terminal result chunk.
    pub fn write_result(&self, value: serde_json::Value) {
        self.sink.emit(Chunk::Result(value));
    }

    /// Emits the terminal error chunk (also logged as a warning).
    pub fn write_error(&self, message: &str, fields: &[(&str, &str)]) {
        warn!(target: "testground::progress", "{}", message);
        let mut merged = self.base.clone();
        for (k, v) in fields {
            merged.insert((*k).to_string(), (*v).to_string());
        }
        self.sink.emit(Chunk::Error(ChunkError {
            message: message.to_string(),
            fields: merged,
        }));
    }

    /// Next sequence number that would be assigned. Used by resubscribing
    /// readers to deduplicate replayed history against the live tail.
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}
