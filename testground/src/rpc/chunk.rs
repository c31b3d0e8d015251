//! Chunk types for the streaming protocol.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for ProgressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressLevel::Debug => "debug",
            ProgressLevel::Info => "info",
            ProgressLevel::Warn => "warn",
            ProgressLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A structured log record carried inside a progress chunk.
///
/// `seq` is monotonic within one stream, which lets a resubscribing client
/// discard records it has already seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub level: ProgressLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// Terminal error payload. Human-readable message plus key/value context;
/// stack traces never cross the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkError {
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// One element of the streaming response.
///
/// A well-formed stream is zero or more `progress` chunks followed by
/// exactly one `result` or `error` chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Chunk {
    Progress(ProgressRecord),
    Result(serde_json::Value),
    Error(ChunkError),
}

impl Chunk {
    /// True for `result` and `error` chunks, which end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Chunk::Result(_) | Chunk::Error(_))
    }

    /// Sequence number, when the chunk carries one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Chunk::Progress(rec) => Some(rec.seq),
            _ => None,
        }
    }

    /// Serializes the chunk as a single newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            // Serialization of these types cannot fail for valid UTF-8
            // payloads; fall back to a bare error chunk if it ever does.
            r#"{"type":"error","payload":{"message":"chunk serialization failed"}}"#.to_string()
        });
        line.push('\n');
        line
    }
}
