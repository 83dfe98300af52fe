// Initialization utilities for pipeline runs
//
// Logging/tracing setup and a startup banner describing the configured stores

use cdnarchive_config::{LogFormat, LoggingConfig, RuntimeConfig, StorageBackend};
use tracing::info;

/// Initialize tracing/logging from the logging section
pub fn init_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Parse log level from config
    let env_filter =
        EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Try to set the global subscriber; ignore error if already set (idempotent)
    let _ = match logging.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
    };
}

/// Log where the run reads from and writes to
pub fn log_startup(config: &RuntimeConfig) {
    for source in &config.sources {
        info!(
            source = %source.name,
            location = %source.storage.describe(),
            prefix = %source.prefix,
            "Source group"
        );
    }

    let archive = &config.archive.storage;
    match archive.backend {
        StorageBackend::Fs => info!(
            location = %archive.describe(),
            prefix = %config.archive.prefix,
            "Archiving to filesystem storage"
        ),
        StorageBackend::S3 => {
            let region = archive.s3.as_ref().map(|s3| s3.region.as_str()).unwrap_or("?");
            info!(
                location = %archive.describe(),
                region,
                prefix = %config.archive.prefix,
                "Archiving to S3 storage"
            );
        }
        StorageBackend::R2 => {
            let account = archive.r2.as_ref().map(|r2| r2.account_id.as_str()).unwrap_or("?");
            info!(
                location = %archive.describe(),
                account,
                prefix = %config.archive.prefix,
                "Archiving to R2 storage"
            );
        }
    }

    match &config.archive.verify {
        Some(verify) => info!(location = %verify.describe(), "Verifying archive through separate store"),
        None => info!("Verifying archive through a separate client for the archive store"),
    }

    info!(
        state = %config.state.path,
        staging = %config.staging.dir,
        merge = %config.merge.strategy,
        probe_enabled = config.probe.enabled,
        "Pipeline settings"
    );
}
