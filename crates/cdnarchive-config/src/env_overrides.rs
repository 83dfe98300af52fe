use super::{
    FsConfig, LogFormat, MergeStrategy, R2Config, RuntimeConfig, S3Config, StorageBackend,
    StorageConfig,
};
use anyhow::{anyhow, Context, Result};

pub const ENV_PREFIX: &str = "CDNARCHIVE_";

/// Abstraction over environment-variable lookups so tests can supply their
/// own source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the CDNARCHIVE_ prefix
    /// Used for AWS standard variables (AWS_ACCESS_KEY_ID, etc.)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Logging
    if let Some(level) = get_env_string(env, "LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(format) = get_env_string(env, "LOG_FORMAT") {
        config.logging.format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    // Local paths
    if let Some(path) = get_env_string(env, "STATE_PATH") {
        config.state.path = path;
    }
    if let Some(dir) = get_env_string(env, "STAGING_DIR") {
        config.staging.dir = dir;
    }
    if let Some(dir) = get_env_string(env, "SIDE_CHANNEL_DIR") {
        config.side_channel.dir = dir;
    }

    // Pipeline knobs
    if let Some(val) = get_env_usize(env, "FETCH_CONCURRENCY")? {
        config.fetch.concurrency = val;
    }
    if let Some(val) = get_env_usize(env, "RUNNER_BATCH_SIZE")? {
        config.runner.batch_size = val;
    }
    if let Some(val) = get_env_u64(env, "RUNNER_FILE_TIMEOUT_SECS")? {
        config.runner.file_timeout_secs = val;
    }
    if let Some(val) = get_env_u64(env, "RUNNER_BATCH_TIMEOUT_SECS")? {
        config.runner.batch_timeout_secs = val;
    }
    if let Some(strategy) = get_env_string(env, "MERGE_STRATEGY") {
        config.merge.strategy = strategy
            .parse::<MergeStrategy>()
            .context("Invalid CDNARCHIVE_MERGE_STRATEGY value")?;
    }
    if let Some(val) = get_env_bool(env, "PROBE_ENABLED")? {
        config.probe.enabled = val;
    }
    if let Some(salt) = get_env_string(env, "ANONYMIZE_SALT") {
        config.classifier.anonymize_salt = salt;
    }

    // Archive storage
    if let Some(prefix) = get_env_string(env, "ARCHIVE_PREFIX") {
        config.archive.prefix = normalize_prefix(prefix);
    }
    if let Some(backend) = get_env_string(env, "ARCHIVE_BACKEND") {
        config.archive.storage.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid CDNARCHIVE_ARCHIVE_BACKEND value")?;
    }
    if let Some(path) = get_env_string(env, "ARCHIVE_PATH") {
        config
            .archive
            .storage
            .fs
            .get_or_insert_with(FsConfig::default)
            .path = path;
    }
    if let Some(bucket) = get_env_string(env, "ARCHIVE_S3_BUCKET") {
        ensure_s3(&mut config.archive.storage).bucket = bucket;
    }
    if let Some(region) = get_env_string(env, "ARCHIVE_S3_REGION") {
        ensure_s3(&mut config.archive.storage).region = region;
    }
    if let Some(endpoint) = get_env_string(env, "ARCHIVE_S3_ENDPOINT") {
        ensure_s3(&mut config.archive.storage).endpoint = Some(endpoint);
    }
    if let Some(bucket) = get_env_string(env, "ARCHIVE_R2_BUCKET") {
        ensure_r2(&mut config.archive.storage).bucket = bucket;
    }
    if let Some(account_id) = get_env_string(env, "ARCHIVE_R2_ACCOUNT_ID") {
        ensure_r2(&mut config.archive.storage).account_id = account_id;
    }

    // AWS standard credentials (without CDNARCHIVE_ prefix for compatibility).
    // Only the archive writer picks them up; the verifier keeps its own.
    if config.archive.storage.backend == StorageBackend::R2 {
        if let Some(access_key_id) = get_raw_env_string(env, "AWS_ACCESS_KEY_ID") {
            ensure_r2(&mut config.archive.storage).access_key_id = access_key_id;
        }
        if let Some(secret_access_key) = get_raw_env_string(env, "AWS_SECRET_ACCESS_KEY") {
            ensure_r2(&mut config.archive.storage).secret_access_key = secret_access_key;
        }
    }

    Ok(())
}

fn ensure_s3(storage: &mut StorageConfig) -> &mut S3Config {
    storage.s3.get_or_insert_with(S3Config::default)
}

fn ensure_r2(storage: &mut StorageConfig) -> &mut R2Config {
    storage.r2.get_or_insert_with(R2Config::default)
}

fn get_env_string<E: EnvSource>(env: &E, key: &str) -> Option<String> {
    env.get(key)
}

fn get_raw_env_string<E: EnvSource>(env: &E, key: &str) -> Option<String> {
    env.get_raw(key)
}

fn get_env_usize<E: EnvSource>(env: &E, key: &str) -> Result<Option<usize>> {
    match get_env_string(env, key) {
        Some(val) => {
            let parsed = val
                .parse::<usize>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    match get_env_string(env, key) {
        Some(val) => {
            let parsed = val
                .parse::<u64>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_bool<E: EnvSource>(env: &E, key: &str) -> Result<Option<bool>> {
    match get_env_string(env, key) {
        Some(val) => {
            let parsed = val.parse::<bool>().map_err(|e| {
                anyhow!(
                    "Failed to parse {}{} (expected bool): {}",
                    ENV_PREFIX,
                    key,
                    e
                )
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn normalize_prefix(prefix: String) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix
    } else {
        format!("{}/", prefix)
    }
}
