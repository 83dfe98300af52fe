// cdnarchive-config - Runtime configuration for the archive pipeline
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path (--config flag or CDNARCHIVE_CONFIG env var)
// 3. Config file contents from CDNARCHIVE_CONFIG_CONTENT env var
// 4. Default config file locations (./cdnarchive.toml, ./.cdnarchive.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{apply_env_overrides, EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub staging: StagingConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub side_channel: SideChannelConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A named group of raw log partitions (one bucket/prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Prefix under which `<date>/` partition directories live.
    #[serde(default)]
    pub prefix: String,
    pub storage: StorageConfig,
}

/// Object storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2: Option<R2Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            fs: Some(FsConfig::default()),
            s3: None,
            r2: None,
        }
    }
}

impl StorageConfig {
    /// Human-readable location used in log lines.
    pub fn describe(&self) -> String {
        match self.backend {
            StorageBackend::Fs => format!(
                "fs:{}",
                self.fs.as_ref().map(|fs| fs.path.as_str()).unwrap_or("?")
            ),
            StorageBackend::S3 => format!(
                "s3:{}",
                self.s3.as_ref().map(|s3| s3.bucket.as_str()).unwrap_or("?")
            ),
            StorageBackend::R2 => format!(
                "r2:{}",
                self.r2.as_ref().map(|r2| r2.bucket.as_str()).unwrap_or("?")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
    R2,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::R2 => write!(f, "r2"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "s3" | "aws" => Ok(StorageBackend::S3),
            "r2" | "cloudflare" => Ok(StorageBackend::R2),
            _ => anyhow::bail!("Unsupported storage backend: {}. Supported: fs, s3, r2", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct R2Config {
    pub bucket: String,
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Archive destination plus the independent read path used to verify uploads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Credentials/client used only for verification. Falls back to a
    /// separately built client for `storage` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<StorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: "./cdnarchive.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub dir: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: "./staging".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub concurrency: usize,
    pub progress_interval_secs: u64,
}

impl FetchConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            progress_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Unidentified requests accumulated before one existence probe.
    pub unresolved_batch_size: usize,
    /// Mixed into the client-id digest. Changing it changes every hash.
    pub anonymize_salt: String,
    /// Parsed lines buffered between the file reader and the resolver.
    pub channel_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            unresolved_batch_size: 30,
            anonymize_salt: String::new(),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    /// Executable that runs the generated script, e.g. `ssh` or `sh`.
    pub program: String,
    /// Arguments placed before the script, e.g. `["-o", "BatchMode=yes", "web1"]`.
    pub args: Vec<String>,
    /// Root on the remote host under which `<host><path>` is looked up.
    pub server_root: String,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub max_timeout_secs: u64,
}

impl ProbeConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "ssh".to_string(),
            args: Vec::new(),
            server_root: "/var/www".to_string(),
            max_retries: 10,
            retry_backoff_secs: 10,
            max_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub batch_size: usize,
    pub file_timeout_secs: u64,
    pub batch_timeout_secs: u64,
}

impl RunnerConfig {
    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            file_timeout_secs: 30 * 60,
            batch_timeout_secs: 30 * 60,
        }
    }
}

/// Which global dedupe path the merge stage takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// External sort, bounded-set fallback when it fails.
    #[default]
    Auto,
    ExternalSort,
    BoundedSet,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::Auto => write!(f, "auto"),
            MergeStrategy::ExternalSort => write!(f, "external_sort"),
            MergeStrategy::BoundedSet => write!(f, "bounded_set"),
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(MergeStrategy::Auto),
            "external_sort" | "sort" => Ok(MergeStrategy::ExternalSort),
            "bounded_set" | "fallback" => Ok(MergeStrategy::BoundedSet),
            _ => anyhow::bail!(
                "Unsupported merge strategy: {}. Supported: auto, external_sort, bounded_set",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
    pub sort_program: String,
    /// Passed to the sort program as `-S <size>` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_buffer: Option<String>,
    pub fallback_max_entries: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Auto,
            sort_program: "sort".to_string(),
            sort_buffer: None,
            fallback_max_entries: 5_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub flush_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { flush_size: 500 }
    }
}

/// Rule table for the shipped resolver policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub rules: Vec<ResolverRule>,
    /// Hosts with no rule whose requests are still worth probing.
    #[serde(default)]
    pub probe_hosts: Vec<String>,
    #[serde(default)]
    pub ignore_paths: Vec<String>,
    #[serde(default)]
    pub ignore_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverRule {
    pub host: String,
    pub path_prefix: String,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SideChannelConfig {
    pub dir: String,
}

impl Default for SideChannelConfig {
    fn default() -> Self {
        Self {
            dir: "./side-channel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration from an explicit file path (CLI --config flag)
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[sources]]
        name = "web"
        prefix = "cdn-logs/"
        [sources.storage]
        backend = "s3"
        [sources.storage.s3]
        bucket = "raw-logs"
        region = "eu-west-1"

        [archive]
        prefix = "archive/"
        [archive.storage]
        backend = "fs"
        [archive.storage.fs]
        path = "/srv/archive"

        [merge]
        strategy = "bounded_set"
        sort_program = "gsort"
        fallback_max_entries = 10

        [[resolver.rules]]
        host = "media.example.com"
        path_prefix = "/video/"
        table = "videos"
    "#;

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("fs".parse::<StorageBackend>().unwrap(), StorageBackend::Fs);
        assert_eq!("s3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("r2".parse::<StorageBackend>().unwrap(), StorageBackend::R2);
        assert_eq!("aws".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert!("gcs".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_merge_strategy_from_str() {
        assert_eq!("auto".parse::<MergeStrategy>().unwrap(), MergeStrategy::Auto);
        assert_eq!(
            "external-sort".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::ExternalSort
        );
        assert_eq!(
            "fallback".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::BoundedSet
        );
        assert!("magic".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_default_configs() {
        let config = RuntimeConfig::default();
        assert_eq!(config.fetch.concurrency, 20);
        assert_eq!(config.classifier.unresolved_batch_size, 30);
        assert_eq!(config.probe.max_retries, 10);
        assert_eq!(config.probe.retry_backoff(), Duration::from_secs(10));
        assert_eq!(config.probe.max_timeout(), Duration::from_secs(60));
        assert_eq!(config.runner.batch_size, 100);
        assert_eq!(config.runner.file_timeout(), Duration::from_secs(1800));
        assert_eq!(config.runner.batch_timeout(), Duration::from_secs(1800));
        assert_eq!(config.merge.fallback_max_entries, 5_000_000);
        assert_eq!(config.merge.strategy, MergeStrategy::Auto);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_toml() {
        let config = RuntimeConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 1);
        let web = config.source("web").unwrap();
        assert_eq!(web.prefix, "cdn-logs/");
        assert_eq!(web.storage.backend, StorageBackend::S3);
        assert_eq!(web.storage.describe(), "s3:raw-logs");
        assert_eq!(config.archive.storage.describe(), "fs:/srv/archive");
        assert!(config.archive.verify.is_none());
        assert_eq!(config.merge.strategy, MergeStrategy::BoundedSet);
        assert_eq!(config.merge.sort_program, "gsort");
        assert_eq!(config.resolver.rules[0].table, "videos");
        // Untouched sections keep their defaults
        assert_eq!(config.fetch.concurrency, 20);
        assert!(config.validate().is_ok());
    }
}
