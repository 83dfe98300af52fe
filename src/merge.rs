//! Partition-level merge, global sort and de-duplication.
//!
//! Per-file outputs are streamed into one intermediate file. The primary
//! strategy hands it to an external `sort -u`, which sorts on disk and so
//! scales past memory. The fallback de-duplicates in one streaming pass
//! with a set capped at `fallback_max_entries` and then sorts externally.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use cdnarchive_config::{MergeConfig, MergeStrategy};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

pub const MERGED_FILE: &str = "merged.jsonl";
pub const SORTED_FILE: &str = "sorted.jsonl";
const DEDUPED_FILE: &str = "deduped.jsonl";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeStats {
    pub lines_in: u64,
    pub lines_out: u64,
    /// Times the set hit its cap and was cleared.
    pub resets: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    /// Strategy that produced the final artifact.
    pub strategy: MergeStrategy,
    pub lines_in: u64,
    pub lines_out: u64,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Exact-line streaming de-duplication with a bounded set.
///
/// Once the set holds `max_entries` lines it is cleared; lines already
/// written stay unique among themselves, but a line repeated across the
/// reset may be written twice.
pub fn dedupe_lines(input: &Path, output: &Path, max_entries: usize) -> io::Result<DedupeStats> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let mut stats = DedupeStats::default();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }
        stats.lines_in += 1;

        if seen.contains(&line) {
            continue;
        }
        if seen.len() >= max_entries.max(1) {
            seen.clear();
            stats.resets += 1;
        }
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        stats.lines_out += 1;
        seen.insert(line.clone());
    }

    writer.flush()?;
    Ok(stats)
}

/// Merge `inputs` in `work_dir` into a sorted, de-duplicated file.
pub async fn merge_partition(
    inputs: &[PathBuf],
    work_dir: &Path,
    config: &MergeConfig,
) -> Result<MergeOutcome> {
    let merged = work_dir.join(MERGED_FILE);
    let sorted = work_dir.join(SORTED_FILE);
    let lines_in = concat_files(inputs, &merged).await?;

    let strategy = match config.strategy {
        MergeStrategy::ExternalSort => {
            external_sort(config, &merged, &sorted, true)
                .await
                .map_err(PipelineError::Merge)?;
            MergeStrategy::ExternalSort
        }
        MergeStrategy::BoundedSet => {
            bounded_set(config, &merged, &sorted, work_dir)
                .await
                .map_err(PipelineError::Merge)?;
            MergeStrategy::BoundedSet
        }
        MergeStrategy::Auto => match external_sort(config, &merged, &sorted, true).await {
            Ok(()) => MergeStrategy::ExternalSort,
            Err(primary) => {
                warn!(error = %primary, "External sort failed, using bounded-set fallback");
                bounded_set(config, &merged, &sorted, work_dir)
                    .await
                    .map_err(|fallback| {
                        PipelineError::Merge(format!(
                            "external sort failed ({primary}); fallback failed ({fallback})"
                        ))
                    })?;
                MergeStrategy::BoundedSet
            }
        },
    };

    let lines_out = count_lines(&sorted).await?;
    if let Err(e) = tokio::fs::remove_file(&merged).await {
        warn!(path = %merged.display(), error = %e, "Failed to remove intermediate file");
    }

    info!(
        inputs = inputs.len(),
        lines_in,
        lines_out,
        strategy = %strategy,
        "Partition merged"
    );
    Ok(MergeOutcome {
        strategy,
        lines_in,
        lines_out,
        path: sorted,
    })
}

/// Stream every input into `output` one line at a time.
async fn concat_files(inputs: &[PathBuf], output: &Path) -> Result<u64> {
    let out = tokio::fs::File::create(output)
        .await
        .map_err(|e| PipelineError::staging(output, e))?;
    let mut writer = tokio::io::BufWriter::new(out);
    let mut lines = 0;
    let mut line = Vec::new();

    for input in inputs {
        let file = tokio::fs::File::open(input)
            .await
            .map_err(|e| PipelineError::staging(input, e))?;
        let mut reader = tokio::io::BufReader::new(file);
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| PipelineError::staging(input, e))?;
            if read == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                line.push(b'\n');
            }
            if line.len() == 1 {
                continue;
            }
            writer
                .write_all(&line)
                .await
                .map_err(|e| PipelineError::staging(output, e))?;
            lines += 1;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| PipelineError::staging(output, e))?;
    Ok(lines)
}

/// Run the configured sort program; `unique` selects the primary `-u` mode.
async fn external_sort(
    config: &MergeConfig,
    input: &Path,
    output: &Path,
    unique: bool,
) -> std::result::Result<(), String> {
    let mut command = Command::new(&config.sort_program);
    command.env("LC_ALL", "C");
    if unique {
        command.arg("-u");
        if let Some(buffer) = &config.sort_buffer {
            command.arg("-S").arg(buffer);
        }
    }
    command
        .arg("-o")
        .arg(output)
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let result = command
        .output()
        .await
        .map_err(|e| format!("failed to start '{}': {e}", config.sort_program))?;
    if result.status.success() {
        Ok(())
    } else {
        Err(format!(
            "'{}' exited with {}: {}",
            config.sort_program,
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        ))
    }
}

async fn bounded_set(
    config: &MergeConfig,
    input: &Path,
    output: &Path,
    work_dir: &Path,
) -> std::result::Result<(), String> {
    let deduped = work_dir.join(DEDUPED_FILE);
    let (source, target, cap) = (input.to_path_buf(), deduped.clone(), config.fallback_max_entries);
    let stats = tokio::task::spawn_blocking(move || dedupe_lines(&source, &target, cap))
        .await
        .map_err(|e| format!("dedupe task failed: {e}"))?
        .map_err(|e| format!("streaming dedupe failed: {e}"))?;

    if stats.resets > 0 {
        warn!(
            resets = stats.resets,
            cap = config.fallback_max_entries,
            "Fallback dedupe set reached its cap; output may keep some duplicates"
        );
    }

    let sorted = external_sort(config, &deduped, output, false).await;
    let _ = tokio::fs::remove_file(&deduped).await;
    sorted
}

async fn count_lines(path: &Path) -> Result<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PipelineError::staging(path, e))?;
    let mut reader = tokio::io::BufReader::new(file);
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| PipelineError::staging(path, e))?;
        if read == 0 {
            return Ok(count);
        }
        count += 1;
    }
}
