use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trendcast_core::system_clock;
use trendcast_storage::CacheStore;
use trendcast_sync::{CollectionOutcome, Collector, Engine, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "trendcast")]
#[command(about = "Trend aggregation and distribution server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Seed from cache, serve pull/push endpoints and scrape on a schedule.
    Serve,
    /// Run one collection and save the cache on success.
    Scrape,
    /// Inspect the cache file.
    Cache,
}

const LOG_TARGETS: [&str; 6] = [
    "trendcast",
    "trendcast_core",
    "trendcast_storage",
    "trendcast_adapters",
    "trendcast_sync",
    "trendcast_web",
];

fn init_logging() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let engine = Engine::from_config(config).await?;
            let mut jobs = engine.start().await?;
            let hub = engine.hub.clone();
            tokio::select! {
                served = trendcast_web::serve(hub, engine.config.port) => served?,
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }
            jobs.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Scrape => {
            let engine = Engine::from_config(config).await?;
            let run = engine.orchestrator.collect().await;
            for source in &run.sources {
                println!(
                    "  {}: rows={} added={}{}",
                    source.label,
                    source.raw_rows,
                    source.added,
                    source
                        .error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
            match &run.outcome {
                CollectionOutcome::Collected(snapshot) => {
                    let cached = engine.cache.save(snapshot.records()).await;
                    println!(
                        "scrape complete: run_id={} trends={} cached={} cache={}",
                        run.run_id,
                        snapshot.len(),
                        cached,
                        engine.cache.path().display()
                    );
                }
                CollectionOutcome::Empty => {
                    println!("scrape complete: run_id={} trends=0 (cache untouched)", run.run_id);
                }
            }
        }
        Commands::Cache => {
            let store = CacheStore::new(config.cache_path.clone(), config.cache_ttl(), system_clock());
            match store.load().await {
                Some(loaded) => println!(
                    "cache {}: trends={} timestamp={} age={}s valid={}",
                    store.path().display(),
                    loaded.records.len(),
                    loaded.timestamp_ms(),
                    loaded.age.as_secs(),
                    loaded.is_valid
                ),
                None => println!("cache {}: none", store.path().display()),
            }
        }
    }

    Ok(())
}
