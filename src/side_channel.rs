//! Advisory side-channel logs for manual follow-up.
//!
//! Both files are append-only while a run is in progress and are rewritten
//! without duplicate lines by [`SideChannel::dedupe`] when it ends.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cdnarchive_core::UnmappedSink;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const REMOTE_EXISTS_LOG: &str = "remote_exists.log";
pub const UNMAPPED_LOG: &str = "unmapped.log";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    pub lines_before: u64,
    pub lines_after: u64,
}

pub struct SideChannel {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl SideChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn remote_exists_path(&self) -> PathBuf {
        self.dir.join(REMOTE_EXISTS_LOG)
    }

    pub fn unmapped_path(&self) -> PathBuf {
        self.dir.join(UNMAPPED_LOG)
    }

    /// A request no rule resolved but whose file exists on the origin.
    pub async fn record_remote_exists(&self, host: &str, path: &str, server_path: &str) {
        self.append(&self.remote_exists_path(), &[host, path, server_path])
            .await;
    }

    async fn append(&self, file: &Path, fields: &[&str]) {
        let mut line = fields
            .iter()
            .map(|f| sanitize(f))
            .collect::<Vec<_>>()
            .join("\t");
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.append_line(file, &line).await {
            warn!(path = %file.display(), error = %e, "Failed to append side-channel entry");
        }
    }

    async fn append_line(&self, file: &Path, line: &str) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .await?;
        out.write_all(line.as_bytes()).await?;
        out.flush().await
    }

    /// Rewrite both logs keeping only the first occurrence of each line.
    pub async fn dedupe(&self) -> io::Result<Vec<(PathBuf, DedupeReport)>> {
        let _guard = self.write_lock.lock().await;
        let mut reports = Vec::new();
        for path in [self.remote_exists_path(), self.unmapped_path()] {
            if !tokio::fs::try_exists(&path).await? {
                continue;
            }
            let target = path.clone();
            let report = tokio::task::spawn_blocking(move || dedupe_file(&target))
                .await
                .map_err(io::Error::other)??;
            debug!(
                path = %path.display(),
                before = report.lines_before,
                after = report.lines_after,
                "Deduplicated side-channel log"
            );
            reports.push((path, report));
        }
        Ok(reports)
    }
}

#[async_trait]
impl UnmappedSink for SideChannel {
    async fn record_unmapped(&self, host: &str, path: &str, rule: &str) {
        self.append(&self.unmapped_path(), &[host, path, rule]).await;
    }
}

fn sanitize(field: &str) -> String {
    field.replace(['\t', '\n', '\r'], " ")
}

fn dedupe_file(path: &Path) -> io::Result<DedupeReport> {
    let tmp = path.with_extension("log.tmp");
    let mut report = DedupeReport::default();
    {
        let reader = BufReader::new(File::open(path)?);
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let mut seen = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            report.lines_before += 1;
            if seen.insert(line.clone()) {
                writeln!(writer, "{line}")?;
                report.lines_after += 1;
            }
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(report)
}
