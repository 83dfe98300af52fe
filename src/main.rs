use anyhow::{Context, Result};
use cdnarchive::{init_tracing, log_startup, Pipeline, RunOptions, SideChannel};
use cdnarchive_config::RuntimeConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Archive daily CDN access-log partitions
#[derive(Parser)]
#[command(name = "cdnarchive")]
#[command(version)]
#[command(about = "Archive daily CDN access-log partitions as resolved entity records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process pending partitions (default if no subcommand given)
    Run {
        /// Only process this source group
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,

        /// Process at most N partitions
        #[arg(short, long, value_name = "N")]
        limit: Option<usize>,

        /// Print the run summary as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// List pending partitions without processing them
    Pending {
        /// Only list this source group
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,
    },
    /// De-duplicate the side-channel logs in place
    DedupeLogs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli.command, config))
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RuntimeConfig::load().context("Failed to load configuration")?,
    };

    // CLI flags win over file and environment
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

async fn async_main(command: Option<Commands>, config: RuntimeConfig) -> Result<()> {
    match command {
        Some(Commands::Run { source, limit, json }) => run(config, RunOptions { source, limit }, json).await,
        None => run(config, RunOptions::default(), false).await,
        Some(Commands::Pending { source }) => pending(config, source).await,
        Some(Commands::DedupeLogs) => dedupe_logs(&config).await,
    }
}

async fn run(config: RuntimeConfig, options: RunOptions, json: bool) -> Result<()> {
    log_startup(&config);
    let pipeline = Pipeline::open(config).await?;
    let summary = pipeline.run(&options).await?;

    if json {
        println!("{}", summary.to_json()?);
    }
    if !summary.is_success() {
        anyhow::bail!(
            "{} partition(s) failed{}",
            summary.failed(),
            if summary.halted { "; run halted" } else { "" }
        );
    }
    Ok(())
}

async fn pending(config: RuntimeConfig, source: Option<String>) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    for partition in pipeline.pending(source.as_deref()).await? {
        println!("{}\t{}\t{}", partition.source, partition.date_key, partition.object_prefix);
    }
    Ok(())
}

async fn dedupe_logs(config: &RuntimeConfig) -> Result<()> {
    let side_channel = SideChannel::new(&config.side_channel.dir);
    let reports = side_channel
        .dedupe()
        .await
        .context("Failed to de-duplicate side-channel logs")?;
    for (path, report) in reports {
        println!(
            "{}: {} -> {} lines",
            path.display(),
            report.lines_before,
            report.lines_after
        );
    }
    Ok(())
}
