//! Line classification for one staged file.
//!
//! A blocking reader streams parsed lines through a bounded channel; the
//! async side anonymizes, resolves and writes identified records as JSON
//! lines, and hands unidentified requests to the existence batcher in
//! fixed-size batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cdnarchive_core::{
    normalize_host, normalize_path, Anonymizer, CoreError, DateKey, LineOutcome, LogLines,
    Resolution, ResolvedEntity, Resolver,
};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::debug;

use crate::probe::ExistenceBatcher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    /// Lines read from the file, blank lines included.
    pub lines: u64,
    /// Lines parsed into a record.
    pub records: u64,
    pub identified: u64,
    pub invalid: u64,
    pub unidentified: u64,
    pub malformed: u64,
    /// Lines left after per-file de-duplication.
    pub written: u64,
}

impl FileStats {
    pub fn absorb(&mut self, other: &FileStats) {
        self.lines += other.lines;
        self.records += other.records;
        self.identified += other.identified;
        self.invalid += other.invalid;
        self.unidentified += other.unidentified;
        self.malformed += other.malformed;
        self.written += other.written;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Read(#[from] CoreError),

    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("reader task failed: {0}")]
    Reader(String),
}

pub struct Classifier {
    resolver: Arc<dyn Resolver>,
    anonymizer: Anonymizer,
    batcher: Arc<ExistenceBatcher>,
    batch_size: usize,
    channel_capacity: usize,
}

impl Classifier {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        anonymizer: Anonymizer,
        batcher: Arc<ExistenceBatcher>,
        batch_size: usize,
        channel_capacity: usize,
    ) -> Self {
        Self {
            resolver,
            anonymizer,
            batcher,
            batch_size: batch_size.max(1),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Classify `input`, writing one [`ResolvedEntity`] line per identified
    /// request to `output`.
    pub async fn classify_file(
        &self,
        input: &Path,
        output: &Path,
        date_key: DateKey,
    ) -> Result<FileStats, ClassifyError> {
        let (tx, mut rx) = mpsc::channel::<cdnarchive_core::Result<LineOutcome>>(self.channel_capacity);
        let source = input.to_path_buf();
        let reader = tokio::task::spawn_blocking(move || -> cdnarchive_core::Result<u64> {
            let mut lines = LogLines::open(&source)?;
            for item in lines.by_ref() {
                // Receiver gone: the file was abandoned (deadline or error).
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
            Ok(lines.lines_read())
        });

        let write_error = |source| ClassifyError::Write {
            path: output.to_path_buf(),
            source,
        };
        let file = File::create(output).await.map_err(write_error)?;
        let mut writer = BufWriter::new(file);

        let mut stats = FileStats::default();
        let mut pending = Vec::with_capacity(self.batch_size);

        while let Some(item) = rx.recv().await {
            let record = match item? {
                LineOutcome::Record(record) => record,
                LineOutcome::Malformed { line_no, reason } => {
                    stats.malformed += 1;
                    debug!(file = %input.display(), line_no, reason = %reason, "Skipping malformed line");
                    continue;
                }
            };
            stats.records += 1;

            match self.resolver.resolve(&record.host, &record.path).await {
                Resolution::Identified(entity) => {
                    let client = self.anonymizer.client_digest(&record.client_id);
                    let mut line = ResolvedEntity::new(entity, client, date_key).to_line()?;
                    line.push('\n');
                    writer
                        .write_all(line.as_bytes())
                        .await
                        .map_err(write_error)?;
                    stats.identified += 1;
                }
                Resolution::Invalid => stats.invalid += 1,
                Resolution::Unidentified => {
                    stats.unidentified += 1;
                    pending.push(self.batcher.candidate(
                        &normalize_host(&record.host),
                        &normalize_path(&record.path),
                    ));
                    if pending.len() >= self.batch_size {
                        self.batcher.check(std::mem::take(&mut pending)).await;
                    }
                }
            }
        }

        if !pending.is_empty() {
            self.batcher.check(pending).await;
        }
        writer.flush().await.map_err(write_error)?;

        stats.lines = reader
            .await
            .map_err(|e| ClassifyError::Reader(e.to_string()))??;

        debug!(
            file = %input.display(),
            lines = stats.lines,
            records = stats.records,
            identified = stats.identified,
            unidentified = stats.unidentified,
            malformed = stats.malformed,
            "File classified"
        );
        Ok(stats)
    }
}
