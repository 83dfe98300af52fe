//! Batched, deadline-bounded classification of a partition's files.
//!
//! Files are processed in fixed-size batches, all files of a batch
//! concurrently. Each file has its own deadline; each batch has another.
//! When the batch deadline passes the runner keeps what finished, marks the
//! rest incomplete and moves on.

mod bounded;

pub use bounded::{wait_bounded, BoundedWait};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cdnarchive_config::RunnerConfig;
use cdnarchive_core::DateKey;
use serde::Serialize;
use tracing::{info, warn};

use crate::classify::{Classifier, FileStats};
use crate::merge::dedupe_lines;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FileStatus {
    Succeeded,
    Failed(String),
    /// Still running when the batch deadline passed.
    Incomplete,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub input: PathBuf,
    /// De-duplicated output, present only for succeeded files.
    #[serde(skip)]
    pub output: Option<PathBuf>,
    pub status: FileStatus,
    pub stats: FileStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub incomplete: usize,
    pub records: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerReport {
    pub files: Vec<FileResult>,
    pub batches: Vec<BatchReport>,
}

impl RunnerReport {
    /// Outputs ready for the merge stage, in input order.
    pub fn outputs(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter_map(|f| f.output.clone())
            .collect()
    }

    pub fn count(&self, wanted: fn(&FileStatus) -> bool) -> usize {
        self.files.iter().filter(|f| wanted(&f.status)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, FileStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, FileStatus::Failed(_)))
    }

    pub fn incomplete(&self) -> usize {
        self.count(|s| matches!(s, FileStatus::Incomplete))
    }

    /// Totals across succeeded files.
    pub fn totals(&self) -> FileStats {
        let mut totals = FileStats::default();
        for file in &self.files {
            if file.status == FileStatus::Succeeded {
                totals.absorb(&file.stats);
            }
        }
        totals
    }
}

pub struct BatchRunner {
    classifier: Arc<Classifier>,
    config: RunnerConfig,
    dedupe_max_entries: usize,
}

impl BatchRunner {
    pub fn new(classifier: Arc<Classifier>, config: RunnerConfig, dedupe_max_entries: usize) -> Self {
        Self {
            classifier,
            config,
            dedupe_max_entries,
        }
    }

    /// Classify `files`, leaving per-file outputs in `work_dir`.
    pub async fn run(&self, files: &[PathBuf], work_dir: &Path, date_key: DateKey) -> RunnerReport {
        let batch_size = self.config.batch_size.max(1);
        let mut report = RunnerReport::default();

        for (index, chunk) in files.chunks(batch_size).enumerate() {
            let tasks = chunk.iter().enumerate().map(|(offset, input)| {
                let slot = index * batch_size + offset;
                let job = FileJob {
                    classifier: self.classifier.clone(),
                    input: input.clone(),
                    scratch: work_dir.join(format!("{slot:06}.scratch.jsonl")),
                    output: work_dir.join(format!("{slot:06}.jsonl")),
                    date_key,
                    dedupe_max_entries: self.dedupe_max_entries,
                };
                (input.clone(), job.run(self.config.file_timeout()))
            });

            let wait = wait_bounded(tasks, self.config.batch_timeout()).await;
            let mut batch = BatchReport {
                index,
                ..BatchReport::default()
            };
            let mut results = Vec::with_capacity(chunk.len());

            for (input, joined) in wait.completed {
                let outcome = joined.unwrap_or_else(|e| Err(format!("file task failed: {e}")));
                results.push(match outcome {
                    Ok((output, stats)) => {
                        batch.succeeded += 1;
                        batch.records += stats.written;
                        FileResult {
                            input,
                            output: Some(output),
                            status: FileStatus::Succeeded,
                            stats,
                        }
                    }
                    Err(reason) => {
                        batch.failed += 1;
                        warn!(file = %input.display(), reason = %reason, "File failed");
                        FileResult {
                            input,
                            output: None,
                            status: FileStatus::Failed(reason),
                            stats: FileStats::default(),
                        }
                    }
                });
            }
            for input in wait.pending {
                batch.incomplete += 1;
                warn!(file = %input.display(), "File did not finish before the batch deadline");
                results.push(FileResult {
                    input,
                    output: None,
                    status: FileStatus::Incomplete,
                    stats: FileStats::default(),
                });
            }

            info!(
                batch = index,
                files = chunk.len(),
                succeeded = batch.succeeded,
                failed = batch.failed,
                incomplete = batch.incomplete,
                records = batch.records,
                "Batch finished"
            );
            results.sort_by(|a, b| a.input.cmp(&b.input));
            report.files.extend(results);
            report.batches.push(batch);
        }

        report
    }
}

struct FileJob {
    classifier: Arc<Classifier>,
    input: PathBuf,
    scratch: PathBuf,
    output: PathBuf,
    date_key: DateKey,
    dedupe_max_entries: usize,
}

impl FileJob {
    async fn run(self, deadline: Duration) -> Result<(PathBuf, FileStats), String> {
        match tokio::time::timeout(deadline, self.process()).await {
            Ok(result) => result,
            Err(_) => Err(format!("file deadline of {}s exceeded", deadline.as_secs())),
        }
    }

    async fn process(self) -> Result<(PathBuf, FileStats), String> {
        let mut stats = self
            .classifier
            .classify_file(&self.input, &self.scratch, self.date_key)
            .await
            .map_err(|e| e.to_string())?;

        let (scratch, output, cap) = (self.scratch, self.output, self.dedupe_max_entries);
        let dedupe = tokio::task::spawn_blocking(move || {
            let stats = dedupe_lines(&scratch, &output, cap);
            let _ = std::fs::remove_file(&scratch);
            stats.map(|stats| (output, stats))
        })
        .await
        .map_err(|e| format!("dedupe task failed: {e}"))?;

        let (output, dedupe) = dedupe.map_err(|e| format!("per-file dedupe failed: {e}"))?;
        stats.written = dedupe.lines_out;
        Ok((output, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{CircuitBreaker, ExistenceBatcher};
    use crate::side_channel::SideChannel;
    use async_trait::async_trait;
    use cdnarchive_config::ProbeConfig;
    use cdnarchive_core::{Anonymizer, EntityRef, Resolution, Resolver};

    /// Resolves `/v/<id>`; requests for `/slow/*` take ten minutes.
    struct SlowResolver;

    #[async_trait]
    impl Resolver for SlowResolver {
        async fn resolve(&self, _host: &str, path: &str) -> Resolution {
            if path.starts_with("/slow/") {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            match path.strip_prefix("/v/") {
                Some(id) => Resolution::Identified(EntityRef::new("videos", id)),
                None => Resolution::Invalid,
            }
        }
    }

    fn runner(dir: &Path, config: RunnerConfig) -> BatchRunner {
        let batcher = Arc::new(ExistenceBatcher::new(
            ProbeConfig::default(),
            Arc::new(CircuitBreaker::new()),
            Arc::new(SideChannel::new(dir.join("side"))),
        ));
        let classifier = Classifier::new(
            Arc::new(SlowResolver),
            Anonymizer::new(""),
            batcher,
            30,
            16,
        );
        BatchRunner::new(Arc::new(classifier), config, 1000)
    }

    fn write(dir: &Path, name: &str, paths: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let body: Vec<String> = paths
            .iter()
            .map(|p| format!(r#"{{"host":"h","path":"{p}","client_id":"c"}}"#))
            .collect();
        std::fs::write(&path, body.join("\n")).unwrap();
        path
    }

    #[tokio::test]
    async fn duplicate_lines_within_a_file_are_collapsed() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let files = vec![
            write(dir.path(), "a.json", &["/v/1", "/v/1", "/v/2"]),
            write(dir.path(), "b.json", &["/other"]),
        ];

        let report = runner(dir.path(), RunnerConfig::default())
            .run(&files, &work, "20240101".parse().unwrap())
            .await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.files[0].stats.identified, 3);
        assert_eq!(report.files[0].stats.written, 2);
        assert_eq!(report.batches, vec![BatchReport {
            index: 0,
            succeeded: 2,
            failed: 0,
            incomplete: 0,
            records: 2,
        }]);
        assert_eq!(report.outputs().len(), 2);
        assert!(!work.join("000000.scratch.jsonl").exists());
    }

    #[tokio::test]
    async fn batch_deadline_keeps_finished_files() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let files = vec![
            write(dir.path(), "a.json", &["/v/1"]),
            write(dir.path(), "b.json", &["/slow/1"]),
            write(dir.path(), "c.json", &["/v/3"]),
        ];
        let config = RunnerConfig {
            batch_size: 2,
            file_timeout_secs: 3600,
            batch_timeout_secs: 2,
        };

        let report = runner(dir.path(), config)
            .run(&files, &work, "20240101".parse().unwrap())
            .await;

        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.batches[0].succeeded, 1);
        assert_eq!(report.batches[0].incomplete, 1);
        assert_eq!(report.batches[1].succeeded, 1);
        assert_eq!(report.files[1].status, FileStatus::Incomplete);
        assert_eq!(report.totals().written, 2);
    }

    #[tokio::test]
    async fn file_deadline_fails_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let files = vec![
            write(dir.path(), "a.json", &["/v/1"]),
            write(dir.path(), "b.json", &["/slow/1"]),
        ];
        let config = RunnerConfig {
            batch_size: 10,
            file_timeout_secs: 1,
            batch_timeout_secs: 3600,
        };

        let report = runner(dir.path(), config)
            .run(&files, &work, "20240101".parse().unwrap())
            .await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert!(matches!(&report.files[1].status, FileStatus::Failed(r) if r.contains("deadline")));
        assert_eq!(report.incomplete(), 0);
    }
}
