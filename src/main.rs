//! Season Extractor
//!
//! Command-line entry point: runs an extraction and maintains the cache.

use clap::{Parser, Subcommand};
use season_extractor::{
    cancel::CancelToken,
    client::ReqwestTransport,
    config::Config,
    data::{parse_team_list, parse_week_range},
    ingester::SourceParams,
    orchestrator::{ExtractionOptions, Orchestrator},
    storage::{CacheParams, CacheStore},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "season-extractor")]
#[command(about = "Extract and merge per-player weekly stats for one season")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full season extraction
    Run {
        /// Season to extract (defaults to the configured one)
        #[arg(long)]
        season: Option<i32>,
        /// Weeks to keep, e.g. "1-4" or "1,3,5"
        #[arg(long)]
        weeks: Option<String>,
        /// Teams to fetch, e.g. "ARI,PHI"
        #[arg(long)]
        teams: Option<String>,
        /// Bypass the cache
        #[arg(long)]
        no_cache: bool,
        /// Run cache warmers first
        #[arg(long)]
        warm_cache: bool,
        /// Seconds between requests to each source, overriding the config
        #[arg(long)]
        rate_limit_delay: Option<f64>,
        /// Write the run report as JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove expired and old cache entries
    Cleanup {
        #[arg(long, default_value = "24")]
        older_than_hours: u64,
    },
    /// Show cache statistics
    Stats,
    /// Drop cached entries of one namespace
    Invalidate {
        namespace: String,
        /// Only this logical key, e.g. "ARI_2024" or "season_2024"
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let config = if Path::new(&cli.config).exists() {
        Config::load(&cli.config)?
    } else {
        Config::load_default()?
    };

    match cli.command {
        Commands::Run {
            season,
            weeks,
            teams,
            no_cache,
            warm_cache,
            rate_limit_delay,
            output,
        } => {
            let mut options = ExtractionOptions::from(&config.pipeline);
            if let Some(season) = season {
                options.season = season;
            }
            if let Some(weeks) = weeks {
                options.weeks = Some(parse_week_range(&weeks)?);
            }
            if let Some(teams) = teams {
                options.teams = Some(parse_team_list(&teams)?);
            }
            options.use_cache = options.use_cache && !no_cache;
            options.warm_cache = options.warm_cache || warm_cache;
            if let Some(secs) = rate_limit_delay {
                anyhow::ensure!(secs.is_finite() && secs >= 0.0, "rate limit delay must be >= 0, got {}", secs);
                options.rate_limit_delay = Some(Duration::from_secs_f64(secs));
            }
            run_extraction(config, options, output).await
        }
        Commands::Cleanup { older_than_hours } => {
            let mut config = config;
            config.pipeline.use_cache = true;
            let orchestrator = build_orchestrator(&config)?;
            let counts = orchestrator.cleanup_cache(older_than_hours);
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Commands::Stats => {
            let cache = open_cache(&config)?;
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
            Ok(())
        }
        Commands::Invalidate { namespace, key } => {
            let cache = open_cache(&config)?;
            let params = key
                .as_deref()
                .and_then(|k| SourceParams::from_cache_key(&namespace, k))
                .map(|p| p.cache_params())
                .unwrap_or_else(CacheParams::new);
            let removed = cache.invalidate(&namespace, key.as_deref(), &params);
            println!("Removed {} entries from {}", removed, namespace);
            Ok(())
        }
    }
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let pipeline = &config.pipeline;
    let transport = Arc::new(ReqwestTransport::new(
        pipeline.request_timeout(),
        &pipeline.user_agent,
    )?);
    Ok(Orchestrator::from_config(config, transport)?)
}

fn open_cache(config: &Config) -> anyhow::Result<CacheStore> {
    let dir = shellexpand::tilde(&config.pipeline.cache_dir).into_owned();
    Ok(CacheStore::open(dir, config.pipeline.cache_ttl)?)
}

async fn run_extraction(
    config: Config,
    options: ExtractionOptions,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    tracing::info!("Starting season {} extraction", options.season);

    let orchestrator = build_orchestrator(&config)?;

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling extraction");
            on_signal.cancel();
        }
    });

    let report = orchestrator.orchestrate_full_season(&options, &cancel).await?;

    for source in &report.sources {
        if source.succeeded() {
            tracing::info!("{}: {} records", source.name, source.records);
        } else {
            tracing::error!(
                "{}: {} of {} tasks failed",
                source.name,
                source.failed_tasks,
                source.tasks
            );
        }
    }

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            tracing::info!("Wrote {} records to {}", report.dataset.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
