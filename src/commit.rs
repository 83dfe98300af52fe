//! Upload, independent verification and the processing-state commit.
//!
//! The state row is the commit barrier: it is written only after the
//! archive object has been confirmed through the verify client. A crash
//! anywhere before that leaves the partition pending, and the next run
//! re-uploads (overwriting) and re-verifies.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use cdnarchive_config::ArchiveConfig;
use cdnarchive_core::Partition;
use cdnarchive_state::{ProcessingRecord, StateStore};
use flate2::write::GzEncoder;
use flate2::Compression;
use opendal::{ErrorKind, Operator};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::storage::build_operator;

pub const ARCHIVE_FILE: &str = "archive.jsonl.gz";

/// Size of each chunk handed to the object-store writer.
const UPLOAD_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Archive writer plus a separately constructed verifier.
pub struct ArchiveTarget {
    writer: Operator,
    verifier: Operator,
    prefix: String,
}

impl ArchiveTarget {
    pub fn new(writer: Operator, verifier: Operator, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        Self {
            writer,
            verifier,
            prefix: if trimmed.is_empty() {
                String::new()
            } else {
                format!("{trimmed}/")
            },
        }
    }

    /// The verifier uses `archive.verify` when set, otherwise a second
    /// client for the archive store itself.
    pub fn from_config(config: &ArchiveConfig) -> Result<Self> {
        let writer = build_operator(&config.storage)?;
        let verifier = build_operator(config.verify.as_ref().unwrap_or(&config.storage))?;
        Ok(Self::new(writer, verifier, &config.prefix))
    }

    pub fn archive_path(&self, partition: &Partition) -> String {
        format!(
            "{}{}/{}.jsonl.gz",
            self.prefix, partition.source, partition.date_key
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitOutcome {
    pub archive_path: String,
    pub bytes: u64,
    /// False when a concurrent or earlier run had already written the row.
    pub newly_committed: bool,
}

/// Gzip `input` into `output`, returning the compressed size.
pub async fn compress(input: &Path, output: &Path) -> io::Result<u64> {
    let (input, output) = (input.to_path_buf(), output.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(File::open(&input)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&output)?), Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.flush()?;
        Ok(std::fs::metadata(&output)?.len())
    })
    .await
    .map_err(io::Error::other)?
}

/// Archive `artifact`, verify it, then write the processing-state row.
///
/// Staging is removed only after the row is written.
pub async fn upload_verify_commit(
    target: &ArchiveTarget,
    state: &dyn StateStore,
    partition: &Partition,
    artifact: &Path,
    staging_dir: &Path,
) -> Result<CommitOutcome> {
    let archive_path = target.archive_path(partition);
    let compressed: PathBuf = staging_dir.join(ARCHIVE_FILE);

    let bytes = compress(artifact, &compressed)
        .await
        .map_err(|e| PipelineError::staging(&compressed, e))?;

    upload(&target.writer, &archive_path, &compressed).await?;
    info!(partition = %partition, path = %archive_path, bytes, "Archive uploaded");

    verify(&target.verifier, &archive_path, bytes).await?;
    debug!(partition = %partition, path = %archive_path, "Archive verified");

    let record = ProcessingRecord::downloaded(&partition.source, partition.date_key, &archive_path);
    let newly_committed = state
        .record_processed(&record)
        .await
        .map_err(|e| PipelineError::Commit {
            partition: partition.to_string(),
            message: e.to_string(),
        })?;
    if newly_committed {
        info!(partition = %partition, path = %archive_path, "Partition committed");
    } else {
        warn!(partition = %partition, "Processing state already present; keeping the existing row");
    }

    if let Err(e) = tokio::fs::remove_dir_all(staging_dir).await {
        warn!(path = %staging_dir.display(), error = %e, "Failed to remove staging directory");
    }

    Ok(CommitOutcome {
        archive_path,
        bytes,
        newly_committed,
    })
}

async fn upload(operator: &Operator, path: &str, file: &Path) -> Result<()> {
    let upload_error = |message: String| PipelineError::Upload {
        path: path.to_string(),
        message,
    };

    let mut source = tokio::fs::File::open(file)
        .await
        .map_err(|e| PipelineError::staging(file, e))?;
    let mut writer = operator
        .writer(path)
        .await
        .map_err(|e| upload_error(e.to_string()))?;

    loop {
        let mut chunk = Vec::with_capacity(UPLOAD_CHUNK_BYTES);
        let read = (&mut source)
            .take(UPLOAD_CHUNK_BYTES as u64)
            .read_to_end(&mut chunk)
            .await
            .map_err(|e| PipelineError::staging(file, e))?;
        if read == 0 {
            break;
        }
        if let Err(e) = writer.write(chunk).await {
            let _ = writer.abort().await;
            return Err(upload_error(e.to_string()));
        }
    }

    writer
        .close()
        .await
        .map_err(|e| upload_error(e.to_string()))?;
    Ok(())
}

async fn verify(operator: &Operator, path: &str, expected_bytes: u64) -> Result<()> {
    let verify_error = |message: String| PipelineError::Verify {
        path: path.to_string(),
        message,
    };

    let meta = operator.stat(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => verify_error("object not found through the verify client".to_string()),
        _ => verify_error(e.to_string()),
    })?;

    if meta.content_length() != expected_bytes {
        return Err(verify_error(format!(
            "expected {expected_bytes} bytes, found {}",
            meta.content_length()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdnarchive_core::DateKey;
    use cdnarchive_state::SqliteStateStore;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn partition() -> Partition {
        Partition {
            source: "web".to_string(),
            date_key: "20240101".parse::<DateKey>().unwrap(),
            object_prefix: "logs/20240101/".to_string(),
        }
    }

    fn fs_operator(root: &Path) -> Operator {
        Operator::new(opendal::services::Fs::default().root(&root.display().to_string()))
            .unwrap()
            .finish()
    }

    fn staged(dir: &Path) -> (PathBuf, PathBuf) {
        let staging = dir.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let artifact = staging.join("sorted.jsonl");
        std::fs::write(&artifact, "a\nb\n").unwrap();
        (staging, artifact)
    }

    #[tokio::test]
    async fn verified_upload_writes_the_state_row() {
        let dir = tempfile::tempdir().unwrap();
        let archive_root = dir.path().join("archive");
        let target = ArchiveTarget::new(fs_operator(&archive_root), fs_operator(&archive_root), "/cdn/");
        let state = SqliteStateStore::in_memory().await.unwrap();
        let (staging, artifact) = staged(dir.path());

        let outcome = upload_verify_commit(&target, &state, &partition(), &artifact, &staging)
            .await
            .unwrap();
        assert_eq!(outcome.archive_path, "cdn/web/20240101.jsonl.gz");
        assert!(outcome.newly_committed);
        assert!(!staging.exists());

        let mut body = String::new();
        GzDecoder::new(File::open(archive_root.join("cdn/web/20240101.jsonl.gz")).unwrap())
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "a\nb\n");

        let row = state
            .processing_record("web", partition().date_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.archive_path, outcome.archive_path);
    }

    #[tokio::test]
    async fn failed_verification_leaves_no_state_row() {
        let dir = tempfile::tempdir().unwrap();
        let target = ArchiveTarget::new(
            fs_operator(&dir.path().join("written")),
            fs_operator(&dir.path().join("elsewhere")),
            "",
        );
        let state = SqliteStateStore::in_memory().await.unwrap();
        let (staging, artifact) = staged(dir.path());

        let err = upload_verify_commit(&target, &state, &partition(), &artifact, &staging)
            .await
            .unwrap_err();
        assert!(err.halts_run());
        assert!(state
            .processing_record("web", partition().date_key)
            .await
            .unwrap()
            .is_none());
        assert!(staging.exists());
    }

    #[tokio::test]
    async fn recommit_after_crash_keeps_a_single_row() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("archive");
        let target = ArchiveTarget::new(fs_operator(&root), fs_operator(&root), "");
        let state = SqliteStateStore::in_memory().await.unwrap();

        // First attempt "crashed" after the upload: object exists, no row.
        let (staging, artifact) = staged(dir.path());
        let bytes = compress(&artifact, &staging.join(ARCHIVE_FILE)).await.unwrap();
        upload(&target.writer, "web/20240101.jsonl.gz", &staging.join(ARCHIVE_FILE))
            .await
            .unwrap();
        verify(&target.verifier, "web/20240101.jsonl.gz", bytes).await.unwrap();

        let first = upload_verify_commit(&target, &state, &partition(), &artifact, &staging)
            .await
            .unwrap();
        assert!(first.newly_committed);

        let (staging, artifact) = staged(dir.path());
        let second = upload_verify_commit(&target, &state, &partition(), &artifact, &staging)
            .await
            .unwrap();
        assert!(!second.newly_committed);
        assert_eq!(state.processed_date_keys("web").await.unwrap().len(), 1);
    }
}
