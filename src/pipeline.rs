//! Partition pipeline: catalog, fetch, classify, merge, commit.
//!
//! Partitions are processed one at a time in catalog order. A failure is
//! confined to its partition (no state row, staging kept for inspection)
//! unless it is a verification failure, which stops the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cdnarchive_config::RuntimeConfig;
use cdnarchive_core::{Anonymizer, IdentifierCache, IdentifierStore, Partition, RuleResolver};
use cdnarchive_state::{IdentifierWriteback, SqliteStateStore, StateStore};
use tracing::{error, info, warn};

use crate::catalog::{self, SourceHandle};
use crate::classify::Classifier;
use crate::commit::{self, ArchiveTarget};
use crate::error::{PipelineError, Result};
use crate::fetch::fetch_partition;
use crate::merge::merge_partition;
use crate::probe::{CircuitBreaker, ExistenceBatcher};
use crate::runner::BatchRunner;
use crate::side_channel::SideChannel;
use crate::storage::build_operator;
use crate::summary::{PartitionReport, RunSummary};

const RAW_DIR: &str = "raw";
const WORK_DIR: &str = "work";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to one source group.
    pub source: Option<String>,
    /// Process at most this many pending partitions.
    pub limit: Option<usize>,
}

pub struct Pipeline {
    config: RuntimeConfig,
    sources: Vec<SourceHandle>,
    archive: ArchiveTarget,
    state: Arc<dyn StateStore>,
    cache: Arc<IdentifierCache>,
    side_channel: Arc<SideChannel>,
    batcher: Arc<ExistenceBatcher>,
    runner: BatchRunner,
}

impl Pipeline {
    /// Open the SQLite state store named in the config and build the pipeline.
    pub async fn open(config: RuntimeConfig) -> Result<Self> {
        let state = SqliteStateStore::open(Path::new(&config.state.path), config.state.max_connections)
            .await
            .map_err(|e| PipelineError::State(e.to_string()))?;
        Self::with_state(config, Arc::new(state)).await
    }

    pub async fn with_state(config: RuntimeConfig, state: Arc<dyn StateStore>) -> Result<Self> {
        let sources = config
            .sources
            .iter()
            .map(|source| {
                Ok(SourceHandle {
                    name: source.name.clone(),
                    prefix: source.prefix.clone(),
                    operator: build_operator(&source.storage)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let archive = ArchiveTarget::from_config(&config.archive)?;

        let writeback: Arc<dyn IdentifierStore> = Arc::new(IdentifierWriteback::new(state.clone()));
        let cache = Arc::new(IdentifierCache::new(config.cache.flush_size, Some(writeback)));
        let known = state
            .load_identifiers()
            .await
            .map_err(|e| PipelineError::State(e.to_string()))?;
        let preloaded = cache.preload(known);
        info!(identifiers = preloaded, "Identifier cache preloaded");

        let side_channel = Arc::new(SideChannel::new(&config.side_channel.dir));
        let resolver = Arc::new(RuleResolver::new(
            &config.resolver,
            cache.clone(),
            side_channel.clone(),
        ));
        let batcher = Arc::new(ExistenceBatcher::new(
            config.probe.clone(),
            Arc::new(CircuitBreaker::new()),
            side_channel.clone(),
        ));
        let classifier = Arc::new(Classifier::new(
            resolver,
            Anonymizer::new(&config.classifier.anonymize_salt),
            batcher.clone(),
            config.classifier.unresolved_batch_size,
            config.classifier.channel_capacity,
        ));
        let runner = BatchRunner::new(
            classifier,
            config.runner.clone(),
            config.merge.fallback_max_entries,
        );

        Ok(Self {
            config,
            sources,
            archive,
            state,
            cache,
            side_channel,
            batcher,
            runner,
        })
    }

    /// Pending partitions, optionally restricted to one source group.
    pub async fn pending(&self, source: Option<&str>) -> Result<Vec<Partition>> {
        let sources = self.select_sources(source)?;
        catalog::pending_partitions(&sources, self.state.as_ref()).await
    }

    fn select_sources(&self, name: Option<&str>) -> Result<Vec<SourceHandle>> {
        match name {
            None => Ok(self.sources.clone()),
            Some(name) => self
                .sources
                .iter()
                .find(|s| s.name == name)
                .cloned()
                .map(|s| vec![s])
                .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown source group '{name}'"))),
        }
    }

    /// Process every pending partition.
    ///
    /// Only a catalog failure is returned as an error; per-partition
    /// failures are reported in the summary.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let mut pending = self.pending(options.source.as_deref()).await?;
        if let Some(limit) = options.limit {
            pending.truncate(limit);
        }
        info!(partitions = pending.len(), "Run starting");

        let mut summary = RunSummary::default();
        for partition in pending {
            let mut report = PartitionReport::new(&partition);
            let result = self.process_partition(&partition, &mut report).await;
            let halt = match result {
                Ok(()) => false,
                Err(e) => {
                    error!(partition = %partition, stage = e.stage(), error = %e, "Partition failed");
                    report.fail(&e);
                    e.halts_run()
                }
            };
            summary.push(report);
            if halt {
                summary.halted = true;
                break;
            }
        }

        if let Err(e) = self.cache.flush().await {
            warn!(error = %e, "Final identifier write-back failed");
        }
        match self.side_channel.dedupe().await {
            Ok(logs) => {
                for (path, report) in logs {
                    info!(
                        path = %path.display(),
                        before = report.lines_before,
                        after = report.lines_after,
                        "Side-channel log de-duplicated"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Side-channel de-duplication failed"),
        }

        summary.probe = self.batcher.stats();
        summary.log();
        Ok(summary)
    }

    async fn process_partition(&self, partition: &Partition, report: &mut PartitionReport) -> Result<()> {
        let source = self
            .sources
            .iter()
            .find(|s| s.name == partition.source)
            .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown source group '{}'", partition.source)))?;

        let staging = partition.staging_dir(Path::new(&self.config.staging.dir));
        let (raw, work) = prepare_staging(&staging).await?;
        info!(partition = %partition, staging = %staging.display(), "Processing partition");

        let fetched = fetch_partition(&source.operator, partition, &raw, &self.config.fetch).await?;
        report.fetched(fetched.objects);

        let files = self.runner.run(&fetched.files, &work, partition.date_key).await;
        report.classified(&files);

        let merged = merge_partition(&files.outputs(), &work, &self.config.merge).await?;
        report.merged(&merged);

        // New identifiers reach the store before the partition counts as done.
        if let Err(e) = self.cache.flush().await {
            warn!(partition = %partition, error = %e, "Identifier write-back failed; entries stay queued");
        }

        let outcome = commit::upload_verify_commit(
            &self.archive,
            self.state.as_ref(),
            partition,
            &merged.path,
            &staging,
        )
        .await?;
        report.committed(outcome);
        Ok(())
    }
}

/// Start every attempt from an empty staging directory.
async fn prepare_staging(staging: &Path) -> Result<(PathBuf, PathBuf)> {
    if tokio::fs::try_exists(staging).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(staging)
            .await
            .map_err(|e| PipelineError::staging(staging, e))?;
    }
    let raw = staging.join(RAW_DIR);
    let work = staging.join(WORK_DIR);
    for dir in [&raw, &work] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PipelineError::staging(dir, e))?;
    }
    Ok((raw, work))
}
