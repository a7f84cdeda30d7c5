//! feedhub CLI
//!
//! Runs the scheduler in the foreground, or performs single operations
//! against the configured database.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use feedhub::{
    FeedService,
    error::{AppError, Result},
    models::{Config, SourceConfig},
    pipeline::FeedRequest,
    render::FeedFormat,
};

/// feedhub - ingest upstream content and serve generated feeds
#[derive(Parser, Debug)]
#[command(name = "feedhub", version, about = "Feed ingestion and serving pipeline")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "feedhub.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background scheduler until Ctrl-C
    Run,

    /// Run every source once and print the run summary
    Once,

    /// Print a generated feed document
    Feed {
        /// Source id (all sources when omitted)
        #[arg(long)]
        source: Option<String>,

        /// Only items in this category
        #[arg(long)]
        category: Option<String>,

        /// Number of items (0 = configured default)
        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// Output format: rss or json
        #[arg(long, default_value = "rss")]
        format: FeedFormat,
    },

    /// Print scheduler, breaker, cache and item status as JSON
    Status,

    /// Validate the configuration file
    Validate,

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Initialize logging; `--verbose` wins over the configured level.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn load_config(path: &Path, verbose: bool) -> Config {
    match Config::load(path) {
        Ok(config) => {
            init_logging(verbose, &config.logging.level);
            log::info!("Loaded configuration from {}", path.display());
            config
        }
        Err(e) => {
            let config = Config::default();
            init_logging(verbose, &config.logging.level);
            log::warn!(
                "Config load failed from {}: {}. Using defaults.",
                path.display(),
                e
            );
            config
        }
    }
}

fn sample_config() -> Config {
    let mut config = Config::default();
    let mut source = SourceConfig::new("en-us", "https://cdn.example.com/{version}/en-us.json");
    source.version_url = Some("https://cdn.example.com/version.txt".into());
    source.base_url = Some("https://www.example.com/en-us/".into());
    source.title = Some("Example News (US)".into());
    source.language = Some("en-US".into());
    config.sources.push(source);
    config
}

async fn run_scheduler(service: FeedService) -> Result<()> {
    service.start();
    log::info!("Scheduler running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down; press Ctrl-C again to skip sources not yet started");

    let shutdown = service.shutdown();
    tokio::pin!(shutdown);
    tokio::select! {
        _ = &mut shutdown => {}
        _ = tokio::signal::ctrl_c() => {
            service.scheduler().cancel();
            shutdown.await;
        }
    }
    Ok(())
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::InitConfig { force } = cli.command {
        init_logging(cli.verbose, "info");
        if cli.config.exists() && !force {
            return Err(AppError::config(format!(
                "{} already exists; use --force to overwrite",
                cli.config.display()
            )));
        }
        let text = toml::to_string_pretty(&sample_config())?;
        std::fs::write(&cli.config, text)?;
        log::info!("Wrote default configuration to {}", cli.config.display());
        return Ok(());
    }

    let config = load_config(&cli.config, cli.verbose);

    match cli.command {
        Command::Validate => {
            log::info!("Validating configuration...");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("✓ Config OK ({} sources)", config.sources.len());
        }

        Command::Run => {
            let service = FeedService::from_config(config).await?;
            run_scheduler(service).await?;
        }

        Command::Once => {
            let service = FeedService::from_config(config).await?;
            let run = service.trigger_update().await?;
            service.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }

        Command::Feed {
            source,
            category,
            limit,
            format,
        } => {
            let service = FeedService::from_config(config).await?;
            let mut request = FeedRequest::new(format).with_limit(limit);
            request.source = source;
            request.category = category;
            let document = service.get_feed(&request).await?;
            println!("{}", document.as_str());
        }

        Command::Status => {
            let service = FeedService::from_config(config).await?;
            let status = service.get_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::InitConfig { .. } => {}
    }

    Ok(())
}
