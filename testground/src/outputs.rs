//! Run output archiving.
//!
//! Process and container runners keep instance outputs on the local
//! filesystem under `<outputs>/<runner>/<plan>/<run-id>/<group>/<i>`.
//! Collection produces a single gzip-compressed tarball rooted at the
//! run id, streamed to the caller chunk by chunk.

use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;

/// `Write` adapter that forwards bytes into an async channel. Used from
/// a blocking task, where `blocking_send` is the correct bridge.
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "archive receiver dropped")
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Archives every output tree recorded for `run_id` under `base`,
/// streaming a `.tar.gz` into `out`. The archive is rooted at the run
/// id: `<run-id>/<group>/<instance>/...`.
pub async fn archive_run(
    base: &Path,
    run_id: &str,
    out: mpsc::Sender<Bytes>,
) -> std::io::Result<()> {
    let base = base.to_path_buf();
    let run_id = run_id.to_string();

    tokio::task::spawn_blocking(move || {
        let mut run_dirs = Vec::new();
        if base.is_dir() {
            for plan_entry in std::fs::read_dir(&base)? {
                let plan_dir = plan_entry?.path();
                let candidate = plan_dir.join(&run_id);
                if candidate.is_dir() {
                    run_dirs.push(candidate);
                }
            }
        }

        if run_dirs.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no outputs found for run {}", run_id),
            ));
        }

        let writer = ChannelWriter { tx: out };
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut archive = tar::Builder::new(encoder);

        for dir in run_dirs {
            archive.append_dir_all(&run_id, &dir)?;
        }

        archive.into_inner()?.finish()?.flush()
    })
    .await
    .map_err(|err| std::io::Error::other(format!("archive task failed: {}", err)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeSet;

    async fn collect_archive(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(chunk) = rx.recv().await {
            data.extend_from_slice(&chunk);
        }
        data
    }

    fn entry_paths(data: &[u8]) -> BTreeSet<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_archive_contains_group_subtrees_and_instance_leaves() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path();

        // Two groups with two and one instances respectively.
        for (group, count) in [("clients", 2), ("servers", 1)] {
            for i in 0..count {
                let dir = base.join("plan/r-1").join(group).join(i.to_string());
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("run.out"), format!("{}-{}", group, i)).unwrap();
            }
        }

        let (tx, mut rx) = mpsc::channel(16);
        let archiver = archive_run(base, "r-1", tx);
        let (result, data) = tokio::join!(archiver, collect_archive(&mut rx));
        result.unwrap();

        let paths = entry_paths(&data);
        assert!(paths.contains("r-1/clients/0/run.out"));
        assert!(paths.contains("r-1/clients/1/run.out"));
        assert!(paths.contains("r-1/servers/0/run.out"));
        assert!(!paths.iter().any(|p| p.contains("r-2")));
    }

    #[tokio::test]
    async fn test_missing_run_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let archiver = archive_run(tmp.path(), "r-missing", tx);
        let (result, _) = tokio::join!(archiver, collect_archive(&mut rx));
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_distinct_runs_do_not_contaminate() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path();

        for run in ["r-1", "r-2"] {
            let dir = base.join("plan").join(run).join("all/0");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("out.txt"), run).unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        let archiver = archive_run(base, "r-2", tx);
        let (result, data) = tokio::join!(archiver, collect_archive(&mut rx));
        result.unwrap();

        let paths = entry_paths(&data);
        assert!(paths.contains("r-2/all/0/out.txt"));
        assert!(!paths.iter().any(|p| p.starts_with("r-1")));
    }
}
