//! Client-facing progress protocol.
//!
//! Every long-running operation the daemon performs streams its progress
//! back to the caller as a sequence of tagged [`Chunk`]s, terminated by a
//! single result or error chunk. The same chunks are what the task engine
//! persists as a task's event log, so a client that reconnects replays the
//! exact stream it missed.
//!
//! Chunks are serialized as newline-delimited JSON objects. A client that
//! loses the connection mid-stream can parse every complete line it
//! received so far.

mod chunk;
mod writer;

pub use chunk::{Chunk, ChunkError, ProgressLevel, ProgressRecord};
pub use writer::{ChannelSink, EventSink, NullSink, OutputWriter};
