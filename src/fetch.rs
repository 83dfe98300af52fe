//! Bounded-concurrency download of a partition's objects into local staging.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cdnarchive_config::FetchConfig;
use cdnarchive_core::Partition;
use futures::stream::{self, StreamExt};
use opendal::{Entry, Operator};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub objects: usize,
    pub bytes: u64,
    #[serde(skip)]
    pub files: Vec<PathBuf>,
    pub elapsed_ms: u64,
}

/// Download every object under the partition prefix into `dest`.
///
/// Relative sub-paths are preserved. The first failed object aborts the
/// whole fetch; calling again for the same partition rewrites every file.
pub async fn fetch_partition(
    operator: &Operator,
    partition: &Partition,
    dest: &Path,
    config: &FetchConfig,
) -> Result<FetchReport> {
    let started = Instant::now();
    let fetch_error = |message: String| PipelineError::Fetch {
        partition: partition.to_string(),
        message,
    };

    let entries: Vec<Entry> = operator
        .list_with(&partition.object_prefix)
        .recursive(true)
        .await
        .map_err(|e| fetch_error(format!("listing '{}': {e}", partition.object_prefix)))?
        .into_iter()
        .filter(|entry| !entry.metadata().mode().is_dir())
        .collect();

    let total = entries.len();
    info!(partition = %partition, objects = total, "Fetching partition");

    let mut progress = Progress::new(total, config.progress_interval());
    let mut files = Vec::with_capacity(total);

    let mut downloads = stream::iter(entries)
        .map(|entry| download(operator, &partition.object_prefix, entry, dest))
        .buffer_unordered(config.concurrency.max(1));

    while let Some(result) = downloads.next().await {
        // Dropping the stream on error cancels the downloads still in flight.
        let (path, bytes) = result.map_err(&fetch_error)?;
        files.push(path);
        progress.record(partition, bytes);
    }

    files.sort();
    let report = FetchReport {
        objects: files.len(),
        bytes: progress.bytes,
        files,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        partition = %partition,
        objects = report.objects,
        bytes = report.bytes,
        elapsed_ms = report.elapsed_ms,
        "Partition fetched"
    );
    Ok(report)
}

async fn download(
    operator: &Operator,
    prefix: &str,
    entry: Entry,
    dest: &Path,
) -> std::result::Result<(PathBuf, u64), String> {
    let relative = entry
        .path()
        .strip_prefix(prefix)
        .unwrap_or(entry.path())
        .trim_start_matches('/');
    if relative.is_empty() || relative.split('/').any(|part| part == "..") {
        return Err(format!("refusing unsafe object path '{}'", entry.path()));
    }
    let target = dest.join(relative);

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("creating '{}': {e}", parent.display()))?;
    }

    let read_error = |e: &dyn std::fmt::Display| format!("reading '{}': {e}", entry.path());
    let write_error = |e: std::io::Error| format!("writing '{}': {e}", target.display());

    // Objects can be large; copy chunk by chunk instead of buffering them.
    let mut chunks = operator
        .reader(entry.path())
        .await
        .map_err(|e| read_error(&e))?
        .into_bytes_stream(..)
        .await
        .map_err(|e| read_error(&e))?;
    let mut file = tokio::fs::File::create(&target).await.map_err(write_error)?;
    let mut bytes = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| read_error(&e))?;
        file.write_all(&chunk).await.map_err(write_error)?;
        bytes += chunk.len() as u64;
    }
    file.flush().await.map_err(write_error)?;

    debug!(object = entry.path(), bytes, "Object fetched");
    Ok((target, bytes))
}

/// Throughput and ETA reporting at a fixed cadence.
struct Progress {
    total: usize,
    done: usize,
    bytes: u64,
    started: Instant,
    last_report: Instant,
    interval: Duration,
}

impl Progress {
    fn new(total: usize, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            total,
            done: 0,
            bytes: 0,
            started: now,
            last_report: now,
            interval,
        }
    }

    fn record(&mut self, partition: &Partition, bytes: u64) {
        self.done += 1;
        self.bytes += bytes;
        if self.last_report.elapsed() < self.interval || self.done == self.total {
            return;
        }
        self.last_report = Instant::now();

        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let rate = self.done as f64 / elapsed;
        let eta_secs = (self.total - self.done) as f64 / rate.max(f64::EPSILON);
        info!(
            partition = %partition,
            done = self.done,
            total = self.total,
            mib_per_sec = %format!("{:.2}", self.bytes as f64 / elapsed / (1024.0 * 1024.0)),
            eta_secs = eta_secs.round() as u64,
            "Fetch progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdnarchive_core::DateKey;

    fn partition() -> Partition {
        Partition {
            source: "web".to_string(),
            date_key: "20240101".parse::<DateKey>().unwrap(),
            object_prefix: "logs/20240101/".to_string(),
        }
    }

    async fn memory_with(objects: &[(&str, &str)]) -> Operator {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        for (path, body) in objects {
            op.write(path, body.to_string()).await.unwrap();
        }
        op
    }

    #[tokio::test]
    async fn preserves_relative_paths_and_is_repeatable() {
        let op = memory_with(&[
            ("logs/20240101/a.json", "a\n"),
            ("logs/20240101/hour=01/b.json.gz", "bb"),
            ("logs/20240102/c.json", "other day"),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            concurrency: 2,
            ..FetchConfig::default()
        };

        for _ in 0..2 {
            let report = fetch_partition(&op, &partition(), dir.path(), &config)
                .await
                .unwrap();
            assert_eq!(report.objects, 2);
            assert_eq!(report.bytes, 4);
            assert_eq!(
                report.files,
                vec![dir.path().join("a.json"), dir.path().join("hour=01/b.json.gz")]
            );
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.json")).unwrap(),
            "a\n"
        );
        assert!(!dir.path().join("c.json").exists());
    }

    #[tokio::test]
    async fn unwritable_destination_fails_the_fetch() {
        let op = memory_with(&[
            ("logs/20240101/a.json", "a\n"),
            ("logs/20240101/sub/b.json", "b\n"),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the object's directory must go.
        std::fs::write(dir.path().join("sub"), b"").unwrap();

        let err = fetch_partition(&op, &partition(), dir.path(), &FetchConfig::default())
            .await
            .unwrap_err();
        match err {
            PipelineError::Fetch { partition, message } => {
                assert_eq!(partition, "web/20240101");
                assert!(message.contains("sub"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_partition_fetches_nothing() {
        let op = memory_with(&[("logs/20240102/c.json", "x")]).await;
        let dir = tempfile::tempdir().unwrap();
        let report = fetch_partition(&op, &partition(), dir.path(), &FetchConfig::default())
            .await
            .unwrap();
        assert_eq!(report.objects, 0);
        assert!(report.files.is_empty());
    }
}
