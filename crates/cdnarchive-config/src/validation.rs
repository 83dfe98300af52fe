// Configuration validation
//
// Validates that required fields are present and values are sensible

use crate::*;
use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_sources(&config.sources)?;

    validate_storage_config("archive.storage", &config.archive.storage)?;
    if let Some(verify) = config.archive.verify.as_ref() {
        validate_storage_config("archive.verify", verify)?;
    }

    if config.state.path.is_empty() {
        bail!("state.path must not be empty");
    }
    if config.state.max_connections == 0 {
        bail!("state.max_connections must be greater than 0");
    }
    if config.staging.dir.is_empty() {
        bail!("staging.dir must not be empty");
    }
    if config.side_channel.dir.is_empty() {
        bail!("side_channel.dir must not be empty");
    }

    validate_fetch_config(&config.fetch)?;
    validate_classifier_config(&config.classifier)?;
    validate_probe_config(&config.probe)?;
    validate_runner_config(&config.runner)?;
    validate_merge_config(&config.merge)?;

    if config.cache.flush_size == 0 {
        bail!("cache.flush_size must be greater than 0");
    }

    Ok(())
}

fn validate_sources(sources: &[SourceConfig]) -> Result<()> {
    if sources.is_empty() {
        bail!("at least one [[sources]] entry is required");
    }

    let mut seen = HashSet::new();
    for source in sources {
        if source.name.is_empty() {
            bail!("sources.name must not be empty");
        }
        if source.name.contains('/') {
            bail!("sources.name '{}' must not contain '/'", source.name);
        }
        if !seen.insert(source.name.as_str()) {
            bail!("duplicate source name '{}'", source.name);
        }
        validate_storage_config(&format!("sources.{}.storage", source.name), &source.storage)?;
    }

    Ok(())
}

fn validate_storage_config(section: &str, config: &StorageConfig) -> Result<()> {
    match config.backend {
        StorageBackend::Fs => {
            let fs = config.fs.as_ref().ok_or_else(|| {
                anyhow::anyhow!("{}: fs storage backend requires 'fs' configuration", section)
            })?;

            if fs.path.is_empty() {
                bail!("{}.fs.path must not be empty", section);
            }
        }
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                anyhow::anyhow!("{}: s3 storage backend requires 's3' configuration", section)
            })?;

            if s3.bucket.is_empty() {
                bail!("{}.s3.bucket is required for S3 backend", section);
            }

            if s3.region.is_empty() {
                bail!("{}.s3.region is required for S3 backend", section);
            }
        }
        StorageBackend::R2 => {
            let r2 = config.r2.as_ref().ok_or_else(|| {
                anyhow::anyhow!("{}: r2 storage backend requires 'r2' configuration", section)
            })?;

            if r2.bucket.is_empty() {
                bail!("{}.r2.bucket is required for R2 backend", section);
            }

            if r2.account_id.is_empty() && r2.endpoint.is_none() {
                bail!(
                    "{}.r2.account_id or {}.r2.endpoint is required for R2 backend",
                    section,
                    section
                );
            }

            if r2.access_key_id.is_empty() || r2.secret_access_key.is_empty() {
                bail!("{}.r2 credentials are required for R2 backend", section);
            }
        }
    }

    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> Result<()> {
    if config.concurrency == 0 {
        bail!("fetch.concurrency must be greater than 0");
    }
    if config.progress_interval_secs == 0 {
        bail!("fetch.progress_interval_secs must be greater than 0");
    }

    if config.concurrency > 256 {
        warn!(
            concurrency = config.concurrency,
            "fetch.concurrency is very large; object store may throttle"
        );
    }

    Ok(())
}

fn validate_classifier_config(config: &ClassifierConfig) -> Result<()> {
    if config.unresolved_batch_size == 0 {
        bail!("classifier.unresolved_batch_size must be greater than 0");
    }
    if config.channel_capacity == 0 {
        bail!("classifier.channel_capacity must be greater than 0");
    }

    if salt_is_blank(config) {
        warn!(
            "classifier.anonymize_salt is empty; client digests are unsalted hashes of the client IP"
        );
    }

    Ok(())
}

/// An unsalted digest of an IPv4 address can be reversed by enumeration.
fn salt_is_blank(config: &ClassifierConfig) -> bool {
    config.anonymize_salt.trim().is_empty()
}

fn validate_probe_config(config: &ProbeConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    if config.program.is_empty() {
        bail!("probe.program must not be empty when the probe is enabled");
    }
    if config.server_root.is_empty() {
        bail!("probe.server_root must not be empty when the probe is enabled");
    }
    if config.max_timeout_secs == 0 {
        bail!("probe.max_timeout_secs must be greater than 0");
    }

    Ok(())
}

fn validate_runner_config(config: &RunnerConfig) -> Result<()> {
    if config.batch_size == 0 {
        bail!("runner.batch_size must be greater than 0");
    }
    if config.file_timeout_secs == 0 {
        bail!("runner.file_timeout_secs must be greater than 0");
    }
    if config.batch_timeout_secs == 0 {
        bail!("runner.batch_timeout_secs must be greater than 0");
    }

    if config.batch_size > 1_000 {
        warn!(
            batch_size = config.batch_size,
            "runner.batch_size is very large; each file holds open handles"
        );
    }

    Ok(())
}

fn validate_merge_config(config: &MergeConfig) -> Result<()> {
    if config.fallback_max_entries == 0 {
        bail!("merge.fallback_max_entries must be greater than 0");
    }
    if config.sort_program.is_empty() {
        bail!("merge.sort_program must not be empty");
    }

    Ok(())
}
