//! Per-instance log multiplexer.
//!
//! Tails the stdout/stderr of many instances concurrently and interleaves
//! their lines into one progress stream, tagged with instance identity.
//! Readers block on I/O only; no locks are held while blocked.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::rpc::OutputWriter;

/// Multiplexes instance output into an [`OutputWriter`].
pub struct LogMultiplexer {
    ow: OutputWriter,
    tails: Vec<JoinHandle<()>>,
}

impl LogMultiplexer {
    pub fn new(ow: OutputWriter) -> Self {
        Self {
            ow,
            tails: Vec::new(),
        }
    }

    /// Starts tailing an instance's stdout and stderr.
    pub fn manage(
        &mut self,
        instance: &str,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stderr: impl AsyncRead + Unpin + Send + 'static,
    ) {
        self.tails
            .push(Self::tail(self.ow.clone(), instance.to_string(), "stdout", stdout));
        self.tails
            .push(Self::tail(self.ow.clone(), instance.to_string(), "stderr", stderr));
    }

    /// Records an instance that never started.
    pub fn fail_start(&self, instance: &str, err: &str) {
        self.ow
            .error("instance failed to start", &[("instance", instance), ("err", err)]);
    }

    /// Waits until every managed stream reached EOF.
    pub async fn wait(self) {
        for tail in self.tails {
            let _ = tail.await;
        }
    }

    fn tail(
        ow: OutputWriter,
        instance: String,
        stream: &'static str,
        reader: impl AsyncRead + Unpin + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        ow.info(&line, &[("instance", &instance), ("stream", stream)]);
                    }
                    Ok(None) => return,
                    Err(err) => {
                        ow.warn(
                            "log stream error",
                            &[("instance", &instance), ("err", &err.to_string())],
                        );
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{ChannelSink, Chunk};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_interleaves_streams_with_identity() {
        let (sink, mut rx) = ChannelSink::new();
        let ow = OutputWriter::new(Arc::new(sink));

        let mut mux = LogMultiplexer::new(ow);
        mux.manage(
            "instance 1",
            std::io::Cursor::new(b"hello\nworld\n".to_vec()),
            std::io::Cursor::new(Vec::new()),
        );
        mux.wait().await;

        let mut lines = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            if let Chunk::Progress(rec) = chunk {
                assert_eq!(rec.fields.get("instance").unwrap(), "instance 1");
                assert_eq!(rec.fields.get("stream").unwrap(), "stdout");
                lines.push(rec.message);
            }
        }
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_fail_start_records_error_progress() {
        let (sink, mut rx) = ChannelSink::new();
        let ow = OutputWriter::new(Arc::new(sink));

        let mux = LogMultiplexer::new(ow);
        mux.fail_start("instance 3", "no such file");
        mux.wait().await;

        let chunk = rx.recv().await.unwrap();
        match chunk {
            Chunk::Progress(rec) => {
                assert_eq!(rec.message, "instance failed to start");
                assert_eq!(rec.fields.get("err").unwrap(), "no such file");
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }
}
